//! Caption suggestion helpers.

use std::io::Read;

use viralize_project_model::{build_prompt, parse_headline_response};

use crate::HeadlineAction;

pub fn run(action: HeadlineAction) -> anyhow::Result<()> {
    match action {
        HeadlineAction::Prompt { context } => {
            println!("{}", build_prompt(context.as_deref()));
        }
        HeadlineAction::Parse { file, json } => {
            let raw = if file.as_os_str() == "-" {
                let mut raw = String::new();
                std::io::stdin().read_to_string(&mut raw)?;
                raw
            } else {
                std::fs::read_to_string(&file)?
            };
            let headlines = parse_headline_response(&raw)?;
            tracing::debug!(count = headlines.len(), "Parsed headlines");
            if json {
                println!("{}", serde_json::to_string_pretty(&headlines)?);
                return Ok(());
            }
            if headlines.is_empty() {
                println!("No headlines in response");
            }
            for headline in &headlines {
                println!("[{}] {}", headline.tone, headline.text);
            }
        }
    }

    Ok(())
}
