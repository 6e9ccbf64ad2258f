use std::fmt::Write as _;
use std::io::{self, Write};

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use crate::agent::{ConversationState, Message, Orchestrator, TurnEvent, TurnOutcome};
use crate::error::{KbError, KbResult};

/// Run one turn (or resume the unfinished one when `message` is `None`),
/// streaming the answer to stdout. Ctrl-C cancels the turn.
pub async fn stream_turn(
    agent: &Orchestrator,
    conversation: &str,
    message: Option<&str>,
) -> KbResult<TurnOutcome> {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = match message {
        Some(text) => agent.run_turn(conversation, text, &cancel, Some(&tx)).await,
        None => agent.resume_turn(conversation, &cancel, Some(&tx)).await,
    };
    watcher.abort();
    drop(tx);

    let streamed = printer.await.unwrap_or(false);
    if streamed {
        println!();
    } else if let Ok(outcome) = &result {
        println!("{}", outcome.answer);
    }
    result
}

async fn print_events(mut rx: UnboundedReceiver<TurnEvent>) -> bool {
    let mut streamed = false;
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Token(token) => {
                print!("{}", token);
                let _ = io::stdout().flush();
                streamed = true;
            }
            TurnEvent::ToolStarted { name, .. } => eprintln!("  [searching {}]", name),
            TurnEvent::ToolFinished { name, is_error: true, .. } => eprintln!("  [{} failed]", name),
            _ => {}
        }
    }
    streamed
}

/// Render a conversation history for the terminal
pub fn format_history(state: &ConversationState) -> String {
    let mut out = String::new();
    for message in state.messages() {
        match message {
            Message::User { content } => {
                let _ = writeln!(out, "user: {}", content);
            }
            Message::Assistant { content, tool_calls } => {
                if !content.is_empty() {
                    let _ = writeln!(out, "assistant: {}", content);
                }
                for call in tool_calls {
                    let _ = writeln!(out, "assistant -> {}({})", call.tool_name, call.arguments);
                }
            }
            Message::Tool { tool_call_id, content, is_error } => {
                let marker = if *is_error { " (error)" } else { "" };
                let _ = writeln!(out, "tool[{}]{}: {}", tool_call_id, marker, content);
            }
        }
    }
    out
}

fn print_help() {
    println!("Commands:");
    println!("  :history   show this conversation");
    println!("  :tools     list the bound knowledge base tools");
    println!("  :resume    retry an interrupted turn");
    println!("  :clear     forget this conversation");
    println!("  exit       quit");
}

pub async fn run(agent: Orchestrator, conversation: String) -> Result<()> {
    println!("kbchat console (conversation '{}')", conversation);
    if agent.tools().is_empty() {
        println!("No knowledge bases found; answers will come from the model alone.");
    } else {
        let names: Vec<&str> = agent.tools().names().collect();
        println!("Knowledge base tools: {}", names.join(", "));
    }
    println!("Ask a question, :help for commands, or 'exit' to quit");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }

        if let Some(command) = input.strip_prefix(':') {
            match command.trim() {
                "history" => print!("{}", format_history(&agent.history(&conversation).await?)),
                "tools" => {
                    for spec in agent.tools().specs() {
                        println!("  {} - {}", spec.name, spec.description);
                    }
                }
                "resume" => report(stream_turn(&agent, &conversation, None).await),
                "clear" => {
                    agent.forget(&conversation).await?;
                    println!("Conversation cleared.");
                }
                "help" => print_help(),
                _ => eprintln!("Unknown command. Available: :history, :tools, :resume, :clear, :help"),
            }
            continue;
        }

        report(stream_turn(&agent, &conversation, Some(input)).await);
    }

    println!("Goodbye!");
    Ok(())
}

fn report(result: KbResult<TurnOutcome>) {
    match result {
        Ok(outcome) if outcome.truncated => eprintln!("(turn ended by the tool round limit)"),
        Ok(_) => {}
        Err(KbError::Cancelled) => eprintln!("(cancelled)"),
        Err(e @ KbError::Gateway(_)) => eprintln!("Error: {}. Type :resume to retry.", e),
        Err(e) => eprintln!("Error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolCallRequest;
    use serde_json::json;

    #[test]
    fn test_format_history() {
        let mut state = ConversationState::new();
        state.append(Message::user("hi")).unwrap();
        state
            .append(Message::assistant_with_calls(
                "",
                vec![ToolCallRequest::new("c1", "docs_knowledge_base_tool", json!({ "query": "q" }))],
            ))
            .unwrap();
        state.append(Message::tool_error("c1", "{\"error\":\"x\"}")).unwrap();
        state.append(Message::assistant("done")).unwrap();

        let text = format_history(&state);
        assert_eq!(
            text,
            "user: hi\n\
             assistant -> docs_knowledge_base_tool({\"query\":\"q\"})\n\
             tool[c1] (error): {\"error\":\"x\"}\n\
             assistant: done\n"
        );
    }
}
