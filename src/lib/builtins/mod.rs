//! Commands implemented inside the shell process. They run synchronously on
//! the shell's own thread because several of them (`cd`, `exit`, `fg`) act on
//! the shell's state rather than a child's.

mod job_control;

use self::job_control::{builtin_bg, builtin_fg, builtin_jobs};
use crate::{
    shell::{
        job::Process,
        pipe_exec::streams::FdWriter,
        signals,
        status::Status,
        Shell,
    },
    version,
};
use std::{collections::BTreeMap, io::Write};

/// The entry point of a builtin: the shell it runs in, and the stage that
/// invoked it (arguments and descriptor slots).
pub type BuiltinFunction = fn(&mut Shell, &Process) -> Status;

const HELP_DESC: &str = "Display this help text\n    help";
const CD_DESC: &str = "Change the current directory\n    cd [dir | -]";

macro_rules! map {
    ($($name:expr => $func:ident: $help:expr),+ $(,)?) => {{
        let mut builtins = BuiltinMap::empty();
        $(builtins.register($name, $help, $func);)+
        builtins
    }};
}

/// A registered builtin.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub help: &'static str,
    pub main: BuiltinFunction,
}

/// The builtin registry. It is filled before the shell starts and only read
/// afterwards; a name that is not registered is run as an external program.
#[derive(Clone)]
pub struct BuiltinMap {
    builtins: BTreeMap<&'static str, Builtin>,
}

impl Default for BuiltinMap {
    fn default() -> Self {
        map!(
            "bg" => builtin_bg : "Resumes a stopped background job\n    bg [job]",
            "cd" => builtin_cd : CD_DESC,
            "exit" => builtin_exit : "Exits the shell with the last recorded status",
            "fg" => builtin_fg : "Moves a background job to the foreground\n    fg [job]",
            "help" => builtin_help : HELP_DESC,
            "jobs" => builtin_jobs : "Displays all jobs that are attached to the background",
        )
    }
}

impl BuiltinMap {
    /// The shell's standard builtins.
    pub fn new() -> Self { Self::default() }

    /// A registry with nothing in it.
    pub fn empty() -> Self { BuiltinMap { builtins: BTreeMap::new() } }

    /// Adds or replaces a builtin. Only possible before the map is handed to a
    /// shell.
    pub fn register(
        &mut self,
        name: &'static str,
        help: &'static str,
        main: BuiltinFunction,
    ) -> &mut Self {
        self.builtins.insert(name, Builtin { name, help, main });
        self
    }

    pub fn lookup(&self, name: &str) -> Option<BuiltinFunction> {
        self.builtins.get(name).map(|builtin| builtin.main)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Builtin> { self.builtins.values() }
}

/// Writes an error line for `builtin` to the stage's stderr slot.
pub(crate) fn report(process: &Process, builtin: &str, message: impl std::fmt::Display) {
    let _ = writeln!(FdWriter(process.fds.stderr()), "jobsh: {}: {}", builtin, message);
}

pub fn builtin_cd(shell: &mut Shell, process: &Process) -> Status {
    match shell.directory.cd(process.argv.get(1).map(String::as_str)) {
        Ok(_) => Status::SUCCESS,
        Err(why) => {
            report(process, "cd", why);
            Status::FAILURE
        }
    }
}

pub fn builtin_exit(shell: &mut Shell, _process: &Process) -> Status {
    shell.teardown();
    std::process::exit(signals::exit_code().as_os_code())
}

pub fn builtin_help(shell: &mut Shell, process: &Process) -> Status {
    let mut out = FdWriter(process.fds.stdout());
    let mut text = format!("{}\n\nBuiltin commands:\n", version());
    for builtin in shell.builtins.iter() {
        let mut lines = builtin.help.lines();
        text.push_str(&format!("  {:<6}{}\n", builtin.name, lines.next().unwrap_or("")));
        for line in lines {
            text.push_str(&format!("      {}\n", line));
        }
    }
    let _ = out.write_all(text.as_bytes());
    Status::SUCCESS
}
