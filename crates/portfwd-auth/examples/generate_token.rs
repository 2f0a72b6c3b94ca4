//! Generate a JWT token carrying forwarding claims
//!
//! Usage:
//!   cargo run --example generate_token -- --secret "your-secret-key"
//!   cargo run --example generate_token -- --secret "your-secret-key" --subject alice \
//!       --bind-address 127.0.0.1 --port 8080 --port 8443

use chrono::Duration;
use clap::Parser;
use portfwd_auth::{ForwardClaims, JwtValidator};

#[derive(Parser, Debug)]
#[command(name = "generate_token")]
#[command(about = "Generate a JWT token for forwarding authorization", long_about = None)]
struct Args {
    /// JWT secret (must match the server's secret)
    #[arg(long, env = "PORTFWD_JWT_SECRET")]
    secret: String,

    /// Principal the token is issued to
    #[arg(long, default_value = "client")]
    subject: String,

    /// Issuer (optional)
    #[arg(long, default_value = "portfwd-server")]
    issuer: String,

    /// Audience (optional)
    #[arg(long, default_value = "portfwd-client")]
    audience: String,

    /// Bind address the holder may listen on (repeatable, default: any)
    #[arg(long = "bind-address")]
    bind_addresses: Vec<String>,

    /// Port the holder may listen on (repeatable, default: any)
    #[arg(long = "port")]
    ports: Vec<u16>,

    /// Issue a token that denies forwarding entirely
    #[arg(long)]
    deny: bool,

    /// Token validity in hours (default: 24)
    #[arg(long, default_value = "24")]
    hours: i64,
}

fn main() {
    let args = Args::parse();

    let claims = ForwardClaims::new(
        args.subject.clone(),
        args.issuer,
        args.audience,
        Duration::hours(args.hours),
    )
    .with_forwarding(!args.deny)
    .with_allowed_bind_addresses(args.bind_addresses)
    .with_allowed_ports(args.ports);

    match JwtValidator::encode(args.secret.as_bytes(), &claims) {
        Ok(token) => {
            println!("Subject:   {}", args.subject);
            println!("Valid for: {} hours", args.hours);
            println!("\nToken:");
            println!("{}\n", token);
        }
        Err(e) => {
            eprintln!("Failed to generate token: {}", e);
            std::process::exit(1);
        }
    }
}
