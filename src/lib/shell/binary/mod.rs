//! Contains the binary logic of jobsh.
mod readln;

pub use self::readln::{LineReader, ReadLine};
use super::{signals, status::Status, Shell};
use std::io::{self, Write};

pub const MAN_JOBSH: &str = r#"NAME
    jobsh - a small job-control shell

SYNOPSIS
    jobsh [ -h | --help ] [ -v | --version ] [-i] [-n] [-c command...]

DESCRIPTION
    jobsh runs pipelines of builtins and external programs, with redirection
    of the job's input, output and error, and job control: jobs run in their
    own process groups, may be sent to the background with a trailing '&',
    and are managed with the jobs, fg and bg builtins.

OPTIONS
    -c
        evaluates the remaining arguments as one command line, then exits.

    -i or --interactive
        treats standard input as a terminal even when it is not one.

    -n or --no-execute
        do not execute any commands, just do syntax checking.

    -v or --version
        prints the version, platform and revision of jobsh then exits.

ENVIRONMENT
    JOBSH_LOG
        a tracing filter for diagnostic output on stderr (default: warn).
"#;

const PROMPT: &str = "jobsh$ ";

pub trait Binary {
    /// Parses and executes the arguments that were supplied to the shell.
    fn execute_arguments<A: Iterator<Item = String>>(&mut self, args: A) -> Status;
    /// Reads and executes commands until the input is exhausted, returning the
    /// recorded exit code.
    fn execute_lines(&mut self, lines: &mut LineReader) -> Status;
    /// Reads commands from standard input, with a prompt when interactive.
    fn execute_interactive(&mut self) -> Status;
    /// Generates the prompt shown before each command.
    fn prompt(&self) -> &str;
}

impl Binary for Shell {
    fn execute_arguments<A: Iterator<Item = String>>(&mut self, mut args: A) -> Status {
        match args.next() {
            Some(mut arg) => {
                for argument in args {
                    arg.push(' ');
                    if argument.is_empty() {
                        arg.push_str("''");
                    } else {
                        arg.push_str(&argument);
                    }
                }
                self.on_command(&arg)
            }
            None => {
                eprintln!("jobsh: -c requires an argument");
                Status::BAD_ARG
            }
        }
    }

    fn execute_lines(&mut self, lines: &mut LineReader) -> Status {
        loop {
            self.reap_pending();
            signals::take(signals::SIGQUIT);

            if self.opts.interactive {
                let stdout = io::stdout();
                let mut stdout = stdout.lock();
                let _ = stdout.write_all(self.prompt().as_bytes());
                let _ = stdout.flush();
            }

            match lines.read_line(|| {
                self.reap_pending();
            }) {
                Ok(ReadLine::Line(line)) => {
                    self.on_command(&line);
                }
                Ok(ReadLine::Interrupted) => (),
                Ok(ReadLine::Eof) => break,
                Err(why) => {
                    eprintln!("jobsh: failed to read input: {}", why.desc());
                    signals::set_exit_code(Status::FAILURE);
                    break;
                }
            }
        }

        if self.opts.interactive {
            println!();
        }
        self.previous_status()
    }

    fn execute_interactive(&mut self) -> Status {
        if let Err(why) = self.init_terminal() {
            eprintln!("jobsh: {}", why);
        }
        self.execute_lines(&mut LineReader::stdin())
    }

    fn prompt(&self) -> &str { PROMPT }
}
