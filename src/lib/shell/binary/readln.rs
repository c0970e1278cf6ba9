use crate::shell::signals;
use nix::{errno::Errno, unistd};
use std::os::unix::io::RawFd;

/// What a call to `LineReader::read_line` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete line, without its terminating newline.
    Line(String),
    /// An interrupt arrived; whatever was typed so far has been discarded.
    Interrupted,
    /// The input is exhausted.
    Eof,
}

/// Reads lines straight from a descriptor, waiting on it together with the
/// signal wake pipe, so a signal arriving while the shell sits at the prompt
/// is acted upon at once instead of after the next keystroke.
#[derive(Debug)]
pub struct LineReader {
    fd:     RawFd,
    buffer: Vec<u8>,
}

impl LineReader {
    pub fn new(fd: RawFd) -> Self { LineReader { fd, buffer: Vec::with_capacity(256) } }

    pub fn stdin() -> Self { Self::new(nix::libc::STDIN_FILENO) }

    fn take_line(&mut self, end: usize, consumed: usize) -> ReadLine {
        let line = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        self.buffer.drain(..consumed);
        ReadLine::Line(line)
    }

    /// Blocks until a full line is available. `on_signal` runs every time the
    /// wait wakes up, before input is read.
    pub fn read_line<F: FnMut()>(&mut self, mut on_signal: F) -> nix::Result<ReadLine> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
                return Ok(self.take_line(end, end + 1));
            }

            let readable = signals::wait_readable(Some(self.fd))?;
            if signals::take(signals::SIGINT) {
                self.buffer.clear();
                return Ok(ReadLine::Interrupted);
            }
            on_signal();
            if !readable {
                continue;
            }

            match unistd::read(self.fd, &mut chunk) {
                Ok(0) if self.buffer.is_empty() => return Ok(ReadLine::Eof),
                Ok(0) => {
                    let end = self.buffer.len();
                    return Ok(self.take_line(end, end));
                }
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(Errno::EINTR) => (),
                Err(why) => return Err(why),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{fcntl::OFlag, libc};
    use serial_test::serial;
    use std::{thread, time::Duration};

    #[test]
    #[serial]
    fn splits_lines_and_keeps_an_unterminated_tail() {
        let (reader, writer) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        unistd::write(writer, b"first\n\nsecond\nthird").unwrap();
        unistd::close(writer).unwrap();

        let mut lines = LineReader::new(reader);
        let mut next = || lines.read_line(|| ()).unwrap();
        assert_eq!(next(), ReadLine::Line("first".into()));
        assert_eq!(next(), ReadLine::Line(String::new()));
        assert_eq!(next(), ReadLine::Line("second".into()));
        assert_eq!(next(), ReadLine::Line("third".into()));
        assert_eq!(next(), ReadLine::Eof);
        unistd::close(reader).unwrap();
    }

    #[test]
    #[serial]
    fn interrupt_discards_the_partial_line() {
        signals::install().unwrap();
        signals::take(signals::SIGINT);
        let (reader, writer) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        unistd::write(writer, b"half a comm").unwrap();

        let target = unsafe { libc::pthread_self() };
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            unsafe { libc::pthread_kill(target, libc::SIGINT) };
        });

        let mut lines = LineReader::new(reader);
        assert_eq!(lines.read_line(|| ()).unwrap(), ReadLine::Interrupted);
        interrupter.join().unwrap();

        unistd::write(writer, b"next\n").unwrap();
        unistd::close(writer).unwrap();
        assert_eq!(lines.read_line(|| ()).unwrap(), ReadLine::Line("next".into()));
        unistd::close(reader).unwrap();
        signals::restore_defaults();
    }
}
