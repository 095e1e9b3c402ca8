//! Operator console for the moderation queue.
//!
//! Reads one command per line and writes a one-line reply for each.
//!
//! | Command | Action |
//! |---------|--------|
//! | `list` / `ls` | Show held request ids |
//! | `approve <id>` / `a <id>` | Release a held request |
//! | `drop <id>` / `d <id>` | Reject a held request (403) |
//! | `flush` | Release every held request |
//! | `moderate on\|off` | Start or stop holding requests |
//! | `help` / `?` | Show this table |
//! | `quit` / `q` | Stop reading commands |

use crate::moderation::{MemoryRequestLog, Moderation, ModerationError};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const HELP: &str = "commands: list | approve <id> | drop <id> | flush | moderate on|off | help | quit";

/// A parsed console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Show held request ids.
    List,
    /// Release the request with this id.
    Approve(u64),
    /// Reject the request with this id.
    Drop(u64),
    /// Release every held request.
    Flush,
    /// Turn moderation on or off.
    Moderate(bool),
    /// Show usage.
    Help,
    /// Stop the console.
    Quit,
}

impl Command {
    /// Parse a line. Returns an error message for unknown input or an
    /// argument count that does not fit the verb.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let args: Vec<&str> = words.collect();

        let command = match verb.to_ascii_lowercase().as_str() {
            "list" | "ls" => no_args(verb, &args, Command::List)?,
            "approve" | "a" => Command::Approve(parse_id(verb, &args)?),
            "drop" | "d" => Command::Drop(parse_id(verb, &args)?),
            "flush" => no_args(verb, &args, Command::Flush)?,
            "moderate" => match args.as_slice() {
                ["on"] => Command::Moderate(true),
                ["off"] => Command::Moderate(false),
                _ => return Err("usage: moderate on|off".to_string()),
            },
            "help" | "?" => no_args(verb, &args, Command::Help)?,
            "quit" | "q" => no_args(verb, &args, Command::Quit)?,
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(command)
    }
}

fn no_args(verb: &str, args: &[&str], command: Command) -> Result<Command, String> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(format!("'{}' takes no arguments", verb))
    }
}

fn parse_id(verb: &str, args: &[&str]) -> Result<u64, String> {
    match args {
        [] => Err("missing request id".to_string()),
        [arg] => arg
            .parse()
            .map_err(|_| format!("invalid request id '{}'", arg)),
        _ => Err(format!("too many arguments for '{}'", verb)),
    }
}

/// Applies console commands to shared moderation state.
pub struct Console {
    moderation: Arc<Moderation>,
    records: Option<Arc<MemoryRequestLog>>,
}

impl Console {
    /// Create a console. With `records`, `list` also prints request details.
    pub fn new(moderation: Arc<Moderation>, records: Option<Arc<MemoryRequestLog>>) -> Self {
        Self { moderation, records }
    }

    /// Run one command and return the reply.
    pub fn execute(&self, command: Command) -> String {
        let queue = self.moderation.queue();
        match command {
            Command::List => {
                let ids = queue.list();
                if ids.is_empty() {
                    return "no held requests".to_string();
                }
                ids.iter()
                    .map(|id| self.describe(*id))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Command::Approve(id) => match queue.approve(id) {
                Ok(()) => format!("approved {}", id),
                Err(e) => describe_error(e),
            },
            Command::Drop(id) => {
                if queue.remove(id) {
                    format!("dropped {}", id)
                } else {
                    describe_error(ModerationError::NotFound(id))
                }
            }
            Command::Flush => format!("released {} request(s)", queue.flush()),
            Command::Moderate(enabled) => {
                self.moderation.set_enabled(enabled);
                format!("moderation {}", if enabled { "on" } else { "off" })
            }
            Command::Help => HELP.to_string(),
            Command::Quit => "bye".to_string(),
        }
    }

    fn describe(&self, id: u64) -> String {
        match self.records.as_ref().and_then(|log| log.get(id)) {
            Some(record) => format!(
                "{} {} {} from {}",
                id, record.method, record.uri, record.remote_addr
            ),
            None => id.to_string(),
        }
    }

    /// Read commands from `input` until end of input or `quit`.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let (reply, quit) = match Command::parse(&line) {
                Ok(command) => {
                    debug!("Console command: {:?}", command);
                    (self.execute(command), command == Command::Quit)
                }
                Err(message) => (format!("{} ({})", message, HELP), false),
            };
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
            if quit {
                break;
            }
        }
        Ok(())
    }
}

fn describe_error(error: ModerationError) -> String {
    match error {
        ModerationError::NotFound(id) => format!("no held request {}", id),
        ModerationError::Released(id) => format!("request {} already gone", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::sync::oneshot;

    fn console() -> (Console, Arc<Moderation>) {
        let log = Arc::new(MemoryRequestLog::new());
        let moderation = Arc::new(Moderation::new(log.clone(), true));
        (Console::new(moderation.clone(), Some(log)), moderation)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("list"), Ok(Command::List));
        assert_eq!(Command::parse("  APPROVE 7 "), Ok(Command::Approve(7)));
        assert_eq!(Command::parse("d 3"), Ok(Command::Drop(3)));
        assert_eq!(Command::parse("moderate off"), Ok(Command::Moderate(false)));
        assert_eq!(Command::parse("?"), Ok(Command::Help));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("approve").is_err());
        assert!(Command::parse("approve x").is_err());
        assert!(Command::parse("moderate maybe").is_err());
        assert!(Command::parse("approve 1 2").is_err());
        assert!(Command::parse("moderate on now").is_err());
        assert!(Command::parse("reboot").is_err());
    }

    #[test]
    fn test_parse_rejects_arguments_to_bare_verbs() {
        assert!(Command::parse("flush now").is_err());
        assert!(Command::parse("list 5").is_err());
        assert!(Command::parse("help me").is_err());
        assert!(Command::parse("q now").is_err());
        assert_eq!(
            Command::parse("ls extra"),
            Err("'ls' takes no arguments".to_string())
        );
    }

    #[tokio::test]
    async fn test_approve_and_drop() {
        let (console, moderation) = console();
        let (approve_tx, approve_rx) = oneshot::channel();
        let (drop_tx, drop_rx) = oneshot::channel();
        moderation.queue().add(1, approve_tx);
        moderation.queue().add(2, drop_tx);

        assert_eq!(console.execute(Command::Approve(1)), "approved 1");
        assert_eq!(console.execute(Command::Drop(2)), "dropped 2");
        assert_eq!(console.execute(Command::Approve(9)), "no held request 9");

        assert!(approve_rx.await.is_ok());
        assert!(drop_rx.await.is_err());
        assert_eq!(console.execute(Command::List), "no held requests");
    }

    #[tokio::test]
    async fn test_list_shows_record() {
        let (console, moderation) = console();
        let id = moderation
            .log()
            .save_request(crate::moderation::RequestRecord {
                method: "GET".to_string(),
                uri: "http://site.test/".to_string(),
                host: "site.test".to_string(),
                remote_addr: "127.0.0.1:4000".parse().unwrap(),
                received_at: std::time::SystemTime::now(),
            })
            .await
            .unwrap();
        let (tx, _rx) = oneshot::channel();
        moderation.queue().add(id, tx);

        assert_eq!(
            console.execute(Command::List),
            "1 GET http://site.test/ from 127.0.0.1:4000"
        );
    }

    #[tokio::test]
    async fn test_run_reads_until_quit() {
        let (console, moderation) = console();
        let input = BufReader::new(&b"moderate off\nbogus\nquit\nflush\n"[..]);
        let (writer, mut reader) = tokio::io::duplex(4096);

        console.run(input, writer).await.unwrap();

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "moderation off");
        assert!(lines[1].starts_with("unknown command 'bogus'"));
        assert_eq!(lines[2], "bye");
        assert_eq!(lines.len(), 3);
        assert!(!moderation.is_enabled());
    }
}
