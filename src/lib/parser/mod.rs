//! Turns a command line into a `Job`.
//!
//! The grammar is deliberately small: words with quoting and escapes, pipes,
//! redirections of the job's stdin/stdout/stderr, leading `NAME=value`
//! overrides per stage, and a trailing `&`. There is no expansion of any kind.

use crate::shell::job::{Job, Process, RedirectMode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ParseError {
    #[error("unterminated single quote")]
    UnterminatedSingleQuote,
    #[error("unterminated double quote")]
    UnterminatedDoubleQuote,
    #[error("expected a file name after '{0}'")]
    NoRedirectionTarget(&'static str),
    #[error("empty pipeline stage")]
    EmptyStage,
    #[error("'{0}' is not allowed on this pipeline stage")]
    MisplacedRedirection(&'static str),
    #[error("'&' may only end a command")]
    BackgroundNotLast,
    #[error("expected a command after the variable assignments")]
    AssignmentsOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// A word, and whether any part of it was quoted or escaped.
    Word(String, bool),
    Pipe,
    Redirect(usize, RedirectMode),
    Background,
}

fn operator(fd: usize, mode: RedirectMode) -> &'static str {
    match (fd, mode) {
        (0, _) => "<",
        (2, RedirectMode::Append) => "2>>",
        (2, _) => "2>",
        (_, RedirectMode::Append) => ">>",
        _ => ">",
    }
}

/// Splits a line into words and operators.
#[derive(Debug)]
struct Lexer {
    chars: Vec<char>,
    pos:   usize,
}

impl Lexer {
    fn new(line: &str) -> Self { Lexer { chars: line.chars().collect(), pos: 0 } }

    fn peek(&self) -> Option<char> { self.chars.get(self.pos).copied() }

    fn peek_at(&self, offset: usize) -> Option<char> { self.chars.get(self.pos + offset).copied() }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        self.pos += 1;
        c
    }

    /// Consumes an optional second `>`, returning the matching output mode.
    fn output_mode(&mut self) -> RedirectMode {
        if self.peek() == Some('>') {
            self.pos += 1;
            RedirectMode::Append
        } else {
            RedirectMode::Truncate
        }
    }

    fn single_quoted(&mut self, word: &mut String) -> Result<(), ParseError> {
        loop {
            match self.bump() {
                Some('\'') => return Ok(()),
                Some(c) => word.push(c),
                None => return Err(ParseError::UnterminatedSingleQuote),
            }
        }
    }

    fn double_quoted(&mut self, word: &mut String) -> Result<(), ParseError> {
        loop {
            match self.bump() {
                Some('"') => return Ok(()),
                Some('\\') => match self.bump() {
                    Some(c @ '"') | Some(c @ '\\') | Some(c @ '$') => word.push(c),
                    Some(c) => {
                        word.push('\\');
                        word.push(c);
                    }
                    None => return Err(ParseError::UnterminatedDoubleQuote),
                },
                Some(c) => word.push(c),
                None => return Err(ParseError::UnterminatedDoubleQuote),
            }
        }
    }

    fn word(&mut self) -> Result<Token, ParseError> {
        let mut word = String::new();
        let mut quoted = false;
        while let Some(c) = self.peek() {
            match c {
                c if c.is_whitespace() => break,
                '|' | '&' | '<' | '>' => break,
                '\'' => {
                    self.pos += 1;
                    quoted = true;
                    self.single_quoted(&mut word)?;
                }
                '"' => {
                    self.pos += 1;
                    quoted = true;
                    self.double_quoted(&mut word)?;
                }
                '\\' => {
                    self.pos += 1;
                    quoted = true;
                    word.push(self.bump().unwrap_or('\\'));
                }
                c => {
                    self.pos += 1;
                    word.push(c);
                }
            }
        }
        Ok(Token::Word(word, quoted))
    }

    fn tokens(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let token = match c {
                c if c.is_whitespace() => {
                    self.pos += 1;
                    continue;
                }
                '#' => break,
                '|' => {
                    self.pos += 1;
                    Token::Pipe
                }
                '&' => {
                    self.pos += 1;
                    Token::Background
                }
                '<' => {
                    self.pos += 1;
                    Token::Redirect(0, RedirectMode::Read)
                }
                '>' => {
                    self.pos += 1;
                    Token::Redirect(1, self.output_mode())
                }
                '2' if self.peek_at(1) == Some('>') => {
                    self.pos += 2;
                    Token::Redirect(2, self.output_mode())
                }
                _ => self.word()?,
            };
            tokens.push(token);
        }
        Ok(tokens)
    }
}

fn is_assignment(word: &str) -> Option<(&str, &str)> {
    let eq = word.find('=')?;
    let (name, value) = (&word[..eq], &word[eq + 1..]);
    let mut chars = name.chars();
    let valid = chars.next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Some((name, value))
    } else {
        None
    }
}

/// A stage under construction.
#[derive(Debug, Default)]
struct Stage {
    argv: Vec<String>,
    env:  Vec<(String, String)>,
}

impl Stage {
    fn finish(self) -> Result<Process, ParseError> {
        if !self.argv.is_empty() {
            Ok(Process { env: self.env, ..Process::new(self.argv) })
        } else if !self.env.is_empty() {
            Err(ParseError::AssignmentsOnly)
        } else {
            Err(ParseError::EmptyStage)
        }
    }
}

/// Parses one command line. Returns `Ok(None)` for a line holding nothing but
/// whitespace or a comment.
pub fn parse(line: &str) -> Result<Option<Job>, ParseError> {
    let tokens = Lexer::new(line).tokens()?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut processes = Vec::new();
    let mut stage = Stage::default();
    let mut redirects = Vec::new();
    let mut background = false;
    let mut tokens = tokens.into_iter();

    while let Some(token) = tokens.next() {
        if background {
            return Err(ParseError::BackgroundNotLast);
        }
        match token {
            Token::Word(word, quoted) => match is_assignment(&word).filter(|_| !quoted) {
                Some((name, value)) if stage.argv.is_empty() => {
                    stage.env.push((name.to_owned(), value.to_owned()))
                }
                _ => stage.argv.push(word),
            },
            Token::Pipe => processes.push(std::mem::take(&mut stage).finish()?),
            Token::Redirect(fd, mode) => match tokens.next() {
                Some(Token::Word(path, _)) => redirects.push((processes.len(), fd, path, mode)),
                _ => return Err(ParseError::NoRedirectionTarget(operator(fd, mode))),
            },
            Token::Background => background = true,
        }
    }
    processes.push(stage.finish()?);

    let last = processes.len() - 1;
    let mut job = Job::new(processes);
    for (index, fd, path, mode) in redirects {
        let allowed = if fd == 0 { index == 0 } else { index == last };
        if !allowed {
            return Err(ParseError::MisplacedRedirection(operator(fd, mode)));
        }
        job = job.redirect(fd, path, mode);
    }
    if background {
        job = job.background();
    }
    Ok(Some(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::job::Redirection;
    use std::path::PathBuf;

    fn argv(job: &Job) -> Vec<Vec<&str>> {
        job.processes.iter().map(|p| p.argv.iter().map(String::as_str).collect()).collect()
    }

    #[test]
    fn blank_lines_and_comments_are_empty() {
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("   \t "), Ok(None));
        assert_eq!(parse("# just a comment"), Ok(None));
    }

    #[test]
    fn pipeline_with_redirections() {
        let job = parse("grep -v x < in.txt | sort | uniq -c >> out.txt 2> err.txt &")
            .unwrap()
            .unwrap();
        assert_eq!(argv(&job), vec![vec!["grep", "-v", "x"], vec!["sort"], vec!["uniq", "-c"]]);
        assert_eq!(
            job.redirects,
            [
                Some(Redirection { path: PathBuf::from("in.txt"), mode: RedirectMode::Read }),
                Some(Redirection { path: PathBuf::from("out.txt"), mode: RedirectMode::Append }),
                Some(Redirection { path: PathBuf::from("err.txt"), mode: RedirectMode::Truncate }),
            ]
        );
        assert!(job.background);
    }

    #[test]
    fn operators_need_no_surrounding_spaces() {
        let job = parse("echo hi|cat>out&").unwrap().unwrap();
        assert_eq!(argv(&job), vec![vec!["echo", "hi"], vec!["cat"]]);
        assert_eq!(job.redirects[1].as_ref().unwrap().path, PathBuf::from("out"));
        assert!(job.background);
        // `>out` belongs to the first stage, which is not the last one.
        assert_eq!(parse("echo hi>out|cat"), Err(ParseError::MisplacedRedirection(">")));
    }

    #[test]
    fn quoting_and_escapes() {
        let job = parse(r#"printf '%s|%s' "a \"b\" \$c \n" d\ e '' # trailing"#).unwrap().unwrap();
        assert_eq!(argv(&job), vec![vec!["printf", "%s|%s", "a \"b\" $c \\n", "d e", ""]]);
    }

    #[test]
    fn leading_assignments_become_overrides() {
        let job = parse("LANG=C TZ= sort A=1 | X=y wc").unwrap().unwrap();
        assert_eq!(
            job.processes[0].env,
            vec![("LANG".to_owned(), "C".to_owned()), ("TZ".to_owned(), String::new())]
        );
        assert_eq!(argv(&job), vec![vec!["sort", "A=1"], vec!["wc"]]);
        assert_eq!(job.processes[1].env, vec![("X".to_owned(), "y".to_owned())]);

        // Quoted or malformed names are ordinary words.
        let job = parse("'A=1' 1A=2").unwrap().unwrap();
        assert_eq!(argv(&job), vec![vec!["A=1", "1A=2"]]);
    }

    #[test]
    fn stderr_redirection_needs_the_two_adjacent() {
        let job = parse("cmd 2>>log").unwrap().unwrap();
        assert_eq!(job.redirects[2].as_ref().unwrap().mode, RedirectMode::Append);
        let job = parse("echo 2 > two").unwrap().unwrap();
        assert_eq!(argv(&job), vec![vec!["echo", "2"]]);
        assert!(job.redirects[1].is_some());
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(parse("echo 'oops"), Err(ParseError::UnterminatedSingleQuote));
        assert_eq!(parse("echo \"oops"), Err(ParseError::UnterminatedDoubleQuote));
        assert_eq!(parse("cat <"), Err(ParseError::NoRedirectionTarget("<")));
        assert_eq!(parse("cat > | wc"), Err(ParseError::NoRedirectionTarget(">")));
        assert_eq!(parse("| wc"), Err(ParseError::EmptyStage));
        assert_eq!(parse("ls |"), Err(ParseError::EmptyStage));
        assert_eq!(parse("ls | | wc"), Err(ParseError::EmptyStage));
        assert_eq!(parse("cat | wc < in"), Err(ParseError::MisplacedRedirection("<")));
        assert_eq!(parse("cat 2>> e | wc"), Err(ParseError::MisplacedRedirection("2>>")));
        assert_eq!(parse("sleep 1 & ls"), Err(ParseError::BackgroundNotLast));
        assert_eq!(parse("FOO=bar"), Err(ParseError::AssignmentsOnly));
        assert_eq!(parse("&"), Err(ParseError::EmptyStage));
    }
}
