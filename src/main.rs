use std::process::ExitCode;

use clap::{CommandFactory, Parser, error::ErrorKind};

use castellan::app;
use castellan::cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli { data_dir, command } = cli;

    let command = match command {
        Some(command) => command,
        None => {
            let mut command = Cli::command();
            let _ = command.print_help();
            println!();
            return ExitCode::from(64);
        }
    };

    let result = match command {
        Commands::Create(args) => app::handle_create(args, &data_dir),
        Commands::Start(args) => app::handle_start(args, &data_dir),
        Commands::Stop(args) => app::handle_stop(args, &data_dir),
        Commands::Restart(args) => app::handle_restart(args, &data_dir),
        Commands::Suspend(args) => app::handle_suspend(args, &data_dir),
        Commands::Resume(args) => app::handle_resume(args, &data_dir),
        Commands::Reset(args) => app::handle_reset(args, &data_dir),
        Commands::Destroy(args) => app::handle_destroy(args, &data_dir),
        Commands::Status(args) => app::handle_status(args, &data_dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            app::error::exit_code(&err)
        }
    }
}
