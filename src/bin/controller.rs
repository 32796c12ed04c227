use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpStream;

use overseer::{
    cli::{self, USAGE},
    protocol::{self, Command},
    request::Request,
    OverseerError,
};

/// Client for the overseer job server.
#[derive(Debug, Parser)]
#[command(name = "controller", disable_help_flag = true, override_usage = USAGE)]
struct Args {
    /// `<address> <port>` followed by the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    words: Vec<String>,
}

async fn send(
    address: &str,
    port: u16,
    request: &Request,
) -> Result<Option<String>, OverseerError> {
    let mut stream = TcpStream::connect((address, port)).await?;
    Command::from(request).write_to(&mut stream).await?;

    match request {
        Request::Query(_) => Ok(Some(protocol::read_reply(&mut stream).await?)),
        _ => Ok(None),
    }
}

fn usage_error(message: &str) -> ExitCode {
    eprintln!("{}", message);
    eprintln!("{}", USAGE);
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => return usage_error(&err.to_string()),
    };

    if args.words.iter().take(3).any(|word| word == "--help") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let [address, port, rest @ ..] = args.words.as_slice() else {
        return usage_error("Please specify address and port");
    };
    let port = match port.parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => return usage_error(&format!("Invalid port '{}'", port)),
    };

    let request = match cli::parse_request(rest) {
        Ok(request) => request,
        Err(err) => return usage_error(&err.to_string()),
    };

    match send(address, port, &request).await {
        Ok(Some(reply)) => {
            print!("{}", reply);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
