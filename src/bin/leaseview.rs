//! Standalone viewer for leased lease files.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::DateTime;
use clap::Parser;

use leased::store;

#[derive(Parser)]
#[command(name = "leaseview")]
#[command(version, about = "Print the contents of a leased lease file")]
struct Cli {
    /// Lease file to read
    lease_file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let leases = match store::load(&cli.lease_file) {
        Ok(leases) => leases,
        Err(err) => {
            eprintln!("leaseview: {}: {}", cli.lease_file.display(), err);
            return ExitCode::FAILURE;
        }
    };

    for lease in &leases {
        let start = match DateTime::from_timestamp(lease.start_time, 0) {
            Some(timestamp) => timestamp.format("%a %b %e %H:%M:%S %Y UTC").to_string(),
            None => format!("(invalid timestamp {})", lease.start_time),
        };

        println!("Lease start        {}", start);
        println!("Hardware address   {}", lease.hw);
        println!("IPv4 address       {}", lease.ip);
        println!();
    }

    println!("Total amount of leases: {}", leases.len());

    ExitCode::SUCCESS
}
