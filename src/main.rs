use std::process;
use std::time::Instant;

use clap::Parser;

mod command;
mod config;
mod diag;
mod error;
mod jobs;
mod line;
mod pipes;
mod redirects;
mod shell;

use config::{Cli, Settings};
use diag::debug;

fn main() {
    let cli = Cli::parse();
    let settings = Settings::from(&cli);
    diag::set_debug(settings.debug);

    let start = Instant::now();
    let mut shell = shell::Shell::new(settings);
    debug!("startup took {:?}", start.elapsed());

    let status = match cli.command.as_deref() {
        Some(line) => {
            shell.execute(line);
            shell.last_status()
        }
        None => shell.run(),
    };
    process::exit(status);
}
