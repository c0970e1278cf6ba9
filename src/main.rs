use jobsh::{Binary, Options, Shell, Status, MAN_JOBSH};
use std::{env, process};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("JOBSH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_logging();

    let mut opts = Options { interactive: atty::is(atty::Stream::Stdin), no_exec: false };
    let mut command = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{}", MAN_JOBSH);
                return;
            }
            "-v" | "--version" => {
                println!("{}", jobsh::version());
                return;
            }
            "-i" | "--interactive" => opts.interactive = true,
            "-n" | "--no-execute" => opts.no_exec = true,
            "-c" => {
                command = Some(args.by_ref().collect::<Vec<_>>());
                break;
            }
            _ => {
                eprintln!("jobsh: unknown argument: {}", arg);
                eprintln!("{}", MAN_JOBSH);
                process::exit(Status::BAD_ARG.as_os_code());
            }
        }
    }

    if command.is_some() {
        opts.interactive = false;
    }

    let mut shell = match Shell::new(opts) {
        Ok(shell) => shell,
        Err(why) => {
            eprintln!("jobsh: {}", why);
            process::exit(Status::FAILURE.as_os_code());
        }
    };

    let status = match command {
        Some(words) => shell.execute_arguments(words.into_iter()),
        None => shell.execute_interactive(),
    };
    shell.teardown();
    process::exit(status.as_os_code());
}
