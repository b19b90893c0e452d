use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::Parser;

use ifdiag::{DiagLogger, IfSetup, Ipv4Net, Role, RtnlClient};

#[derive(Parser)]
#[command(version, about = "Bring up host interfaces and report their addresses", long_about = None)]
struct Cli {
    /// IPv4 address to assign to the external interface, bare or in CIDR
    /// notation (a bare address gets a /24). Omitted or empty: no assignment.
    address: Option<String>,

    /// External interface to configure when an address is given
    #[arg(short, long, default_value = "eth0")]
    interface: String,

    /// Tag log lines as client-side instead of server-side
    #[arg(long)]
    client: bool,
}

fn parse_address(raw: &str) -> Result<Ipv4Net, String> {
    if let Ok(prefix) = raw.parse::<Ipv4Net>() {
        return Ok(prefix);
    }
    raw.parse::<Ipv4Addr>()
        .map_err(|err| format!("invalid IPv4 address {:?}: {}", raw, err))
        .and_then(|addr| Ipv4Net::new(addr, 24).map_err(|err| err.to_string()))
}

/// An omitted or empty address argument means "no assignment".
fn resolve_address(raw: Option<&str>) -> Result<Option<Ipv4Net>, String> {
    match raw.filter(|raw| !raw.is_empty()) {
        Some(raw) => parse_address(raw).map(Some),
        None => Ok(None),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let address = match resolve_address(cli.address.as_deref()) {
        Ok(address) => address,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let role = if cli.client { Role::Client } else { Role::Server };
    let logger = DiagLogger::stdout(role);

    let client = RtnlClient::new();
    let setup = IfSetup::with_external_interface(&client, logger, &cli.interface);

    match setup.configure(address) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
