mod app;
mod cache;
mod cli;
mod config;
mod formula;
mod geometry;
mod id;
mod term;
mod utils;

use app::App;
use clap::Parser;
use cli::Cli;

fn main() {
    env_logger::Builder::from_default_env().init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.is_empty() {
        // Print help and exit.
        Cli::parse_from(["ikup", "--help"]);
        return;
    }

    // A single invocation may hold several commands separated by `:`;
    // they run in order against one App (and one set of database handles).
    let chunks = cli::split_multi_commands(&raw);
    let mut commands = Vec::new();
    for chunk in chunks {
        let args = cli::normalize_command_args(chunk);
        let mut argv = vec!["ikup".to_string()];
        argv.extend(args);
        match Cli::try_parse_from(&argv) {
            Ok(parsed) => commands.push(parsed.command),
            // clap reports usage problems with exit code 2 itself.
            Err(err) => err.exit(),
        }
    }

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(err.exit_code());
        }
    };

    // The first explicit output redirection wins for the whole invocation.
    let mut out_command = None;
    let mut out_display = None;
    for command in &commands {
        let (cmd, disp) = cli::output_paths(command);
        out_command = out_command.or(cmd);
        out_display = out_display.or(disp);
    }

    let mut app = match App::new(config, out_command.as_deref(), out_display.as_deref()) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(err.exit_code());
        }
    };

    for command in commands {
        if let Err(err) = cli::run(&mut app, command) {
            eprintln!("error: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}
