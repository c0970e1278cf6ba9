// Embeds the version string shown by `jobsh --version` and the `help` builtin.

use std::{
    env,
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::Command,
};

fn main() {
    match write_version_file() {
        Ok(_) => {}
        Err(e) => panic!("Failed to create a version file: {:?}", e),
    }
}

fn var(name: &str) -> io::Result<String> {
    env::var(name).map_err(|why| io::Error::new(io::ErrorKind::NotFound, why))
}

fn write_version_file() -> io::Result<()> {
    let version = var("CARGO_PKG_VERSION")?;
    let target = var("TARGET")?;
    let version_fname = PathBuf::from(var("OUT_DIR")?).join("version_string");
    let mut version_file = File::create(&version_fname)?;
    let rev = get_git_rev();
    let rev = rev.trim();
    if rev.is_empty() {
        write!(&mut version_file, "r#\"jobsh {} ({})\"#", version, target)?;
    } else {
        write!(&mut version_file, "r#\"jobsh {} ({})\nrev {}\"#", version, target, rev)?;
    }
    Ok(())
}

fn get_git_rev() -> String {
    match Command::new("git").args(&["rev-parse", "HEAD"]).output() {
        Ok(ref out) if out.status.success() => {
            String::from_utf8(out.stdout.clone()).unwrap_or_default()
        }
        _ => git_rev_from_file().unwrap_or_default(),
    }
}

fn git_rev_from_file() -> io::Result<String> {
    let git_file = Path::new(&var("CARGO_MANIFEST_DIR")?)
        .join(".git")
        .join("refs")
        .join("heads")
        .join("master");
    let mut file = File::open(git_file)?;
    let mut rev = String::new();
    file.read_to_string(&mut rev)?;
    Ok(rev)
}
