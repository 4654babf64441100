//! Approval over stdin/stdout

use async_trait::async_trait;
use kestrel_agent::{ApprovalChannel, AskKind, AskResponse, Error, Result, SayKind};
use std::io::{BufRead, Write};

/// Asks the human on the terminal; with `auto_yes` every ask is approved
pub struct ConsoleApproval {
    auto_yes: bool,
}

impl ConsoleApproval {
    pub fn new(auto_yes: bool) -> Self {
        Self { auto_yes }
    }
}

fn label(kind: AskKind) -> &'static str {
    match kind {
        AskKind::Tool => "tool",
        AskKind::MistakeLimitReached => "mistake limit",
        AskKind::AutoApprovalMaxReached => "auto-approval limit",
        AskKind::TaskTokenLimitReached => "token limit",
        AskKind::AutonomyStepLimitReached => "step limit",
        AskKind::ApiRequestFailed => "request failed",
    }
}

/// `y`/`yes` approves, an empty line or `n`/`no` declines, anything else is
/// a message for the agent
pub fn parse_answer(line: &str) -> AskResponse {
    let line = line.trim();
    match line.to_lowercase().as_str() {
        "y" | "yes" => AskResponse::yes(),
        "" | "n" | "no" => AskResponse::no(),
        _ => AskResponse::message(line),
    }
}

/// Read one line from stdin. `None` at end of input.
pub async fn read_line(prompt: &str) -> std::io::Result<Option<String>> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        let mut stdout = std::io::stdout();
        write!(stdout, "{}", prompt)?;
        stdout.flush()?;

        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        Ok((read > 0).then(|| line.trim_end_matches(['\r', '\n']).to_string()))
    })
    .await
    .map_err(std::io::Error::other)?
}

#[async_trait]
impl ApprovalChannel for ConsoleApproval {
    async fn ask(&self, kind: AskKind, payload: &str) -> Result<AskResponse> {
        let body = match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(value) if value.is_object() => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| payload.to_string())
            }
            _ => payload.to_string(),
        };
        println!("\n[{}] {}", label(kind), body);

        if self.auto_yes {
            println!("> yes (auto)");
            return Ok(AskResponse::yes());
        }
        match read_line("[y/n or a message]> ").await {
            Ok(Some(line)) => Ok(parse_answer(&line)),
            Ok(None) => Ok(AskResponse::no()),
            Err(e) => Err(Error::Approval(format!("failed to read answer: {}", e))),
        }
    }

    async fn say(&self, kind: SayKind, text: &str) {
        match kind {
            SayKind::Error => eprintln!("\n[error] {}", text),
            SayKind::Info => println!("\n[info] {}", text),
            SayKind::ApiRequestRetried => println!("\n[retry] {}", text),
        }
    }
}
