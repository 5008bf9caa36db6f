use std::future::Future;
use std::num::ParseIntError;

use chorus_chat::{ChatEvent, ChatResult, ChatService, MultiChatsService, ServiceRecord};
use chorus_llm::{ChatMessage, ChatRole};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::services::ServicesStore;

const HELP: &str = "\
commands:
  /new              start a new chat
  /list             list chats
  /switch N         make chat N current
  /remove N         delete chat N
  /clear            clear the current chat
  /regen            regenerate the last answer
  /regen-from N     regenerate the answer at history index N (negative counts from the end)
  /title [TEXT]     set or reset the chat title
  /abort            stop the running answer (or press Ctrl-C)
  /quit             exit
anything else is sent to the current chat
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    Switch(usize),
    Remove(usize),
    Clear,
    Regenerate,
    RegenerateFrom(isize),
    Title(Option<String>),
    Abort,
    Help,
    Quit,
}

impl Command {
    /// Returns `None` for blank input.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Some(Self::Send(line.to_string())));
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };

        let parsed = match name {
            "new" => Self::New,
            "list" | "ls" => Self::List,
            "switch" => Self::Switch(parse_index(argument, "switch")?),
            "remove" | "rm" => Self::Remove(parse_index(argument, "remove")?),
            "clear" => Self::Clear,
            "regen" => Self::Regenerate,
            "regen-from" => {
                let raw = required(argument, "regen-from")?;
                Self::RegenerateFrom(raw.parse().context(InvalidIndexSnafu {
                    stage: "parse-command-index",
                    raw: raw.to_string(),
                })?)
            }
            "title" => Self::Title(Some(argument.to_string()).filter(|title| !title.is_empty())),
            "abort" => Self::Abort,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            _ => {
                return UnknownCommandSnafu {
                    stage: "parse-command",
                    raw: line.to_string(),
                }
                .fail();
            }
        };
        Ok(Some(parsed))
    }
}

fn required<'a>(argument: &'a str, command: &'static str) -> Result<&'a str, CommandError> {
    Some(argument)
        .filter(|argument| !argument.is_empty())
        .context(MissingArgumentSnafu {
            stage: "parse-command-argument",
            command,
        })
}

fn parse_index(argument: &str, command: &'static str) -> Result<usize, CommandError> {
    let raw = required(argument, command)?;
    raw.parse().context(InvalidIndexSnafu {
        stage: "parse-command-index",
        raw: raw.to_string(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command '{raw}', try /help"))]
    UnknownCommand { stage: &'static str, raw: String },
    #[snafu(display("/{command} needs an argument"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("'{raw}' is not a valid index: {source}"))]
    InvalidIndex {
        stage: &'static str,
        raw: String,
        source: ParseIntError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReplError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type ReplResult<T> = Result<T, ReplError>;

/// Line-oriented driver over one conversation collection.
pub struct Repl<R, W> {
    service: MultiChatsService,
    services: ServicesStore,
    current: usize,
    lines: Lines<BufReader<R>>,
    output: W,
}

impl<R, W> Repl<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(service: MultiChatsService, services: ServicesStore, input: R, output: W) -> Self {
        Self {
            service,
            services,
            current: 0,
            lines: BufReader::new(input).lines(),
            output,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    pub async fn run(&mut self) -> ReplResult<()> {
        let shape = self.service.shape();
        write(
            &mut self.output,
            &format!(
                "{} via {} ({} chats). /help lists commands.\n",
                shape.name,
                self.service.api().info().name,
                self.service.len()
            ),
        )
        .await?;

        loop {
            let line = tokio::select! {
                line = self.lines.next_line() => line.context(ReadInputSnafu { stage: "read-command" })?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };

            match Command::parse(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => self.execute(command).await?,
                Err(error) => write(&mut self.output, &format!("error: {error}\n")).await?,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> ReplResult<()> {
        let chat = self.current_chat();
        match command {
            Command::Send(text) => self.stream_exchange(&chat, chat.send_text(text)).await,
            Command::Regenerate => {
                self.stream_exchange(&chat, chat.regenerate_last_response())
                    .await
            }
            Command::RegenerateFrom(index) => {
                self.stream_exchange(&chat, chat.regenerate_from(index))
                    .await
            }
            Command::New => {
                self.service.create_chat();
                self.current = 0;
                self.save_record();
                write(&mut self.output, "started chat 0\n").await
            }
            Command::List => self.list_chats().await,
            Command::Switch(index) => {
                let Some(chat) = self.service.chat_at(index) else {
                    return write(&mut self.output, &format!("error: no chat at {index}\n"))
                        .await;
                };
                self.current = index;
                chat.load().await;
                write(&mut self.output, &transcript(&chat.history())).await
            }
            Command::Remove(index) => {
                if let Err(error) = self.service.remove_chat_at(index).await {
                    return write(&mut self.output, &format!("error: {error}\n")).await;
                }
                if index < self.current {
                    self.current -= 1;
                }
                self.current = self.current.min(self.service.len().saturating_sub(1));
                self.save_record();
                write(&mut self.output, &format!("removed chat {index}\n")).await
            }
            Command::Clear => {
                let reply = match chat.clear().await {
                    Ok(()) => "cleared\n".to_string(),
                    Err(error) => format!("error: {error}\n"),
                };
                self.save_record();
                write(&mut self.output, &reply).await
            }
            Command::Title(title) => {
                chat.set_custom_title(title).await;
                self.save_record();
                let title = chat.title().unwrap_or_else(|| "untitled".to_string());
                write(&mut self.output, &format!("title: {title}\n")).await
            }
            Command::Abort => write(&mut self.output, "nothing to abort\n").await,
            Command::Help => write(&mut self.output, HELP).await,
            Command::Quit => Ok(()),
        }
    }

    /// Renders chat events until `exchange` resolves. Ctrl-C aborts the exchange.
    async fn stream_exchange<F>(&mut self, chat: &ChatService, exchange: F) -> ReplResult<()>
    where
        F: Future<Output = ChatResult<()>>,
    {
        let mut events = chat.subscribe();
        let mut events_open = true;
        let mut exchange = std::pin::pin!(exchange);

        let result = loop {
            tokio::select! {
                result = &mut exchange => break result,
                event = events.recv(), if events_open => match event {
                    Ok(event) => render(&mut self.output, &event).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "terminal fell behind chat events");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = tokio::signal::ctrl_c() => chat.abort(),
            }
        };

        drain(&mut events, &mut self.output).await?;
        if let Err(error) = result {
            write(&mut self.output, &format!("error: {error}\n")).await?;
        }
        self.save_record();
        Ok(())
    }

    async fn list_chats(&mut self) -> ReplResult<()> {
        let mut listing = String::new();
        for (index, chat) in self.service.chats().iter().enumerate() {
            chat.load().await;
            let marker = if index == self.current { '*' } else { ' ' };
            let title = chat.title().unwrap_or_else(|| "untitled".to_string());
            listing.push_str(&format!(
                "{marker} {index}: {title} ({} messages)\n",
                chat.history().len()
            ));
        }
        write(&mut self.output, &listing).await
    }

    fn current_chat(&mut self) -> ChatService {
        if self.current >= self.service.len() {
            self.current = 0;
        }
        self.service
            .chat_at(self.current)
            .unwrap_or_else(|| self.service.create_chat())
    }

    fn save_record(&self) {
        let record = ServiceRecord::Multi(self.service.to_record());
        if let Err(error) = self.services.upsert(record) {
            tracing::warn!(error = %error, "failed to save services file");
        }
    }

    async fn shutdown(&mut self) {
        for chat in self.service.chats() {
            chat.wait_for_title().await;
        }
        self.save_record();
    }
}

async fn drain<W>(events: &mut broadcast::Receiver<ChatEvent>, output: &mut W) -> ReplResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.try_recv() {
            Ok(event) => render(output, &event).await?,
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => return Ok(()),
        }
    }
}

async fn render<W>(output: &mut W, event: &ChatEvent) -> ReplResult<()>
where
    W: AsyncWrite + Unpin,
{
    let text = match event {
        ChatEvent::MessageBegin => "assistant> ".to_string(),
        ChatEvent::MessageDelta { delta, .. } => match &delta.content {
            Some(content) => content.clone(),
            None => return Ok(()),
        },
        ChatEvent::MessageEnd { message, response } => {
            let mut text = String::from("\n");
            if response.aborted {
                text.push_str("[aborted]\n");
            }
            if let Some(links) = message.as_ref().and_then(|message| message.links.as_ref()) {
                for (index, link) in links.iter().enumerate() {
                    text.push_str(&format!("  [{}] {} <{}>\n", index + 1, link.name, link.url));
                }
            }
            text
        }
        ChatEvent::Error(error) => format!("error: {error}\n"),
        ChatEvent::TitleChanged(Some(title)) => format!("title: {title}\n"),
        _ => return Ok(()),
    };
    write(output, &text).await
}

fn transcript(history: &[ChatMessage]) -> String {
    if history.is_empty() {
        return "(empty chat)\n".to_string();
    }
    history
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let speaker = match message.role {
                ChatRole::User => "you",
                ChatRole::Assistant => "assistant",
                ChatRole::System => "system",
            };
            format!("[{index}] {speaker}> {}\n", message.content)
        })
        .collect()
}

async fn write<W>(output: &mut W, text: &str) -> ReplResult<()>
where
    W: AsyncWrite + Unpin,
{
    output
        .write_all(text.as_bytes())
        .await
        .context(WriteOutputSnafu {
            stage: "write-output",
        })?;
    output.flush().await.context(WriteOutputSnafu {
        stage: "flush-output",
    })
}
