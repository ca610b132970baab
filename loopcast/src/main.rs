use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use loopcast::controller::{ScheduleState, SessionStatus};
use loopcast::logging::{self, LoggingConfig};
use loopcast::media::detect_version;
use loopcast::{AppConfig, SessionController};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_LOG_TAIL: usize = 20;

/// A console command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    List,
    Select(String),
    Key(String),
    Start,
    Stop,
    Schedule(String),
    Status,
    Log(usize),
    Remove(String),
    Filter(Option<String>),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let required = |what: &str| {
            if rest.is_empty() {
                Err(format!("usage: {word} <{what}>"))
            } else {
                Ok(rest.to_string())
            }
        };

        match word.to_lowercase().as_str() {
            "list" | "ls" => Ok(Self::List),
            "select" => required("path or name").map(Self::Select),
            "key" => required("stream key").map(Self::Key),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "schedule" => required("1h30m | 45m | HH:MM").map(Self::Schedule),
            "status" => Ok(Self::Status),
            "log" => {
                if rest.is_empty() {
                    Ok(Self::Log(DEFAULT_LOG_TAIL))
                } else {
                    rest.parse()
                        .map(Self::Log)
                        .map_err(|_| format!("not a line count: {rest}"))
                }
            }
            "remove" | "rm" => required("name").map(Self::Remove),
            "filter" => Ok(Self::Filter((!rest.is_empty()).then(|| rest.to_string()))),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command {other:?}, try `help`")),
        }
    }
}

fn print_help() {
    println!(
        "commands:\n  \
         list                   media in the library\n  \
         select <path|name>     choose the media to stream\n  \
         key <stream key>       store the stream key\n  \
         start | stop           control the stream\n  \
         schedule <expr>        auto-stop after 1h30m / 45m or at HH:MM\n  \
         status                 show the session\n  \
         log [n]                last n lines of the transcoder log\n  \
         remove <name>          delete a library file\n  \
         filter [directive]     show or change the log filter\n  \
         quit"
    );
}

fn print_status(status: &SessionStatus) {
    match status.pid {
        Some(pid) => println!("stream:    running (pid {pid})"),
        None => println!("stream:    stopped"),
    }
    match &status.selected_media {
        Some(path) if status.media_present => println!("media:     {}", path.display()),
        Some(path) => println!("media:     {} (missing)", path.display()),
        None => println!("media:     none selected"),
    }
    match (&status.credential_hint, status.credential_present) {
        (Some(hint), _) => println!("key:       set ({hint})"),
        (None, true) => println!("key:       set"),
        (None, false) => println!("key:       not set"),
    }
    match &status.schedule {
        ScheduleState::None => println!("auto-stop: none"),
        ScheduleState::Active {
            fire_at, remaining, ..
        } => println!(
            "auto-stop: {} (in {}s)",
            fire_at.format("%Y-%m-%d %H:%M:%S %Z"),
            remaining.as_secs()
        ),
        ScheduleState::Lost { job } => {
            println!("auto-stop: {job} was lost when the program restarted and is not active")
        }
    }
}

/// Run one command and print its outcome.
async fn dispatch(controller: &Arc<SessionController>, logging: &LoggingConfig, command: Command) {
    let outcome = async {
        match command {
            Command::List => {
                let media = controller.list_media().await?;
                if media.is_empty() {
                    println!("library {} is empty", controller.config().media_dir.display());
                }
                for entry in media {
                    let marker = if entry.selected { "*" } else { " " };
                    println!("{marker} {} ({} bytes)", entry.name, entry.size_bytes);
                }
            }
            Command::Select(target) => {
                let path = controller.select_media(Path::new(&target)).await?;
                println!("selected {}", path.display());
            }
            Command::Key(key) => {
                controller.set_credential(&key).await?;
                println!("stream key saved");
            }
            Command::Start => {
                let report = controller.start().await?;
                println!(
                    "streaming {} (pid {}, {})",
                    report.media.display(),
                    report.pid,
                    report.mode
                );
            }
            Command::Stop => {
                let pid = controller.stop().await?;
                println!("stopped pid {pid}");
            }
            Command::Schedule(expr) => {
                let report = controller.schedule_stop(&expr)?;
                if let Some(previous) = report.replaced {
                    println!("previous schedule {previous} cancelled");
                }
                println!(
                    "stream will stop at {} (in {}s)",
                    report.fire_at.format("%Y-%m-%d %H:%M:%S %Z"),
                    report.delay.as_secs()
                );
            }
            Command::Status => print_status(&controller.status().await?),
            Command::Log(lines) => {
                for line in controller.transcoder_log_tail(lines).await? {
                    println!("{line}");
                }
            }
            Command::Remove(name) => {
                let path = controller.remove_media(&name).await?;
                println!("removed {}", path.display());
            }
            Command::Filter(None) => println!("{}", logging.get_filter()),
            Command::Filter(Some(directive)) => logging.set_filter(&directive)?,
            Command::Help => print_help(),
            Command::Quit => {}
        }
        Ok::<(), loopcast::Error>(())
    }
    .await;

    if let Err(e) = outcome {
        if e.is_precondition() {
            println!("{e}");
        } else {
            println!("error: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = AppConfig::path_from_env();
    let config = AppConfig::load_or_create(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    let (log_config, _guard) = logging::init_logging(&config.log_dir, config.tz())?;
    let shutdown = CancellationToken::new();
    log_config.start_retention_cleanup(shutdown.clone());

    info!(config = %config_path.display(), "loopcast starting");
    for (tool, binary) in [("ffmpeg", &config.ffmpeg_path), ("ffprobe", &config.ffprobe_path)] {
        match detect_version(binary).await {
            Some(version) => info!(tool, version = %version, "Found tool"),
            None => warn!(tool, binary = %binary, "Tool not found or not runnable"),
        }
    }

    let controller = SessionController::new(Arc::new(config))?;
    if let Some(pid) = controller.supervisor().is_running() {
        info!(pid, "Found a stream left running by a previous session");
    }

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("[event] {}", event.describe()),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped session events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Command::parse(line) {
            Ok(Command::Quit) => break,
            Ok(command) => dispatch(&controller, &log_config, command).await,
            Err(message) => println!("{message}"),
        }
    }

    shutdown.cancel();
    if let Some(pid) = controller.supervisor().is_running() {
        info!(pid, "Exiting; the stream keeps running and can be stopped after a restart");
    }
    info!("loopcast stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("start"), Ok(Command::Start));
        assert_eq!(Command::parse("LOG"), Ok(Command::Log(DEFAULT_LOG_TAIL)));
        assert_eq!(Command::parse("log 5"), Ok(Command::Log(5)));
        assert_eq!(
            Command::parse("select  my movie.mp4"),
            Ok(Command::Select("my movie.mp4".to_string()))
        );
        assert_eq!(
            Command::parse("schedule 1h 30m"),
            Ok(Command::Schedule("1h 30m".to_string()))
        );
        assert_eq!(Command::parse("filter"), Ok(Command::Filter(None)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("select").is_err());
        assert!(Command::parse("log many").is_err());
        assert!(Command::parse("launch").is_err());
    }
}
