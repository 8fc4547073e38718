use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use wayfarer_contracts::compass::{angular_distance, direction_label, Partition};
use wayfarer_contracts::decision::{decision_from_answer, extract_final_answer};
use wayfarer_contracts::links::rank_directions;
use wayfarer_contracts::{Direction, Extraction, VisitedSet};
use wayfarer_engine::{default_transport_registry, BridgeClient, GuideSession};

#[derive(Debug, Parser)]
#[command(name = "wayfarer", version, about = "Panorama tour guide over a chat backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive guide session against the viewer bridge.
    Guide(GuideArgs),
    /// Rank a captured link list against a heading and visited set.
    Rank(RankArgs),
    /// Extract a navigation decision from a captured streamed payload.
    Extract(ExtractArgs),
}

#[derive(Debug, Parser)]
struct GuideArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    bridge_url: Option<String>,
    #[arg(long, default_value = "dify")]
    transport: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long, default_value_t = 0.0)]
    heading: f64,
}

#[derive(Debug, Parser)]
struct RankArgs {
    #[arg(long)]
    links: PathBuf,
    #[arg(long, default_value_t = 0.0)]
    heading: f64,
    #[arg(long)]
    visited: Vec<String>,
}

#[derive(Debug, Parser)]
struct ExtractArgs {
    #[arg(long)]
    payload: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("wayfarer error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Guide(args) => {
            run_guide(args)?;
            Ok(0)
        }
        Command::Rank(args) => {
            run_rank(args)?;
            Ok(0)
        }
        Command::Extract(args) => run_extract(args),
    }
}

fn run_guide(args: GuideArgs) -> Result<()> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));

    let mut registry = default_transport_registry();
    let Some(transport) = registry.take(&args.transport) else {
        bail!(
            "unknown transport '{}' (available: {})",
            args.transport,
            registry.names().join(", ")
        );
    };
    let bridge = match args.bridge_url.as_deref() {
        Some(url) => BridgeClient::new(url),
        None => BridgeClient::from_env(),
    };

    let mut session = GuideSession::new(
        events_path,
        transport,
        Box::new(bridge.clone()),
        Box::new(bridge.clone()),
        Box::new(bridge),
        args.user.clone(),
        args.heading,
    )?;

    println!(
        "Wayfarer guide started (session {}). Type /help for commands.",
        session.session_id()
    );

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/help" => {
                println!("/links          show ranked unvisited directions");
                println!("/reset <pano>   clear visit history, keep <pano>");
                println!("/quit           leave the session");
                println!("anything else is sent to the guide");
                continue;
            }
            "/links" => {
                match session.candidates() {
                    Ok(candidates) if candidates.is_empty() => {
                        println!("no unvisited directions here");
                    }
                    Ok(candidates) => print_candidates(&candidates, session.current_heading()),
                    Err(err) => eprintln!("link fetch failed: {err:#}"),
                }
                continue;
            }
            _ => {}
        }

        if let Some(rest) = input.strip_prefix("/reset") {
            let pano = rest.trim();
            if pano.is_empty() {
                eprintln!("usage: /reset <pano-id>");
            } else {
                session.reset(pano)?;
                println!("history reset, keeping {pano}");
            }
            continue;
        }

        match session.ask(input) {
            Ok(reply) => {
                for warning in &reply.warnings {
                    eprintln!("warning: {warning}");
                }
                if let Some(commentary) = &reply.commentary {
                    println!("{commentary}");
                }
                if let (Some(pano), Some(heading)) = (&reply.navigated_to, reply.heading) {
                    println!("navigating to {pano} (heading {heading}°)");
                }
                if let Some(raw) = &reply.raw_answer {
                    println!("{raw}");
                }
                if reply.commentary.is_none()
                    && reply.raw_answer.is_none()
                    && reply.navigated_to.is_none()
                {
                    println!("(no answer)");
                }
            }
            Err(err) => eprintln!("request failed: {err:#}"),
        }
    }

    println!("Visited {} locations this session.", session.visited_count());
    Ok(())
}

fn print_candidates(candidates: &[Direction], current_heading: f64) {
    for (idx, candidate) in candidates.iter().enumerate() {
        let label = direction_label(current_heading, candidate.heading, Partition::EightWay);
        let distance = angular_distance(current_heading, candidate.heading);
        let description = if candidate.description.trim().is_empty() {
            "direction"
        } else {
            candidate.description.trim()
        };
        println!(
            "{}. {} [{} {:.0}°] (id: {})",
            idx + 1,
            description,
            label.as_str(),
            distance,
            candidate.pano_id
        );
    }
}

fn run_rank(args: RankArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.links)
        .with_context(|| format!("failed reading {}", args.links.display()))?;
    let directions = parse_links(&raw)?;

    let mut visited = VisitedSet::new();
    for pano in &args.visited {
        visited.mark(pano.clone());
    }

    let ranked = rank_directions(&directions, args.heading, &visited);
    if ranked.is_empty() {
        println!("no candidates (all visited or empty input)");
        return Ok(());
    }
    print_candidates(&ranked, args.heading);
    Ok(())
}

/// Accepts either a bare array of links or the bridge response shape
/// `{"links": [...]}`.
fn parse_links(raw: &str) -> Result<Vec<Direction>> {
    let value: Value = serde_json::from_str(raw).context("links file is not valid JSON")?;
    let links = match value {
        Value::Array(_) => value,
        Value::Object(ref object) => object
            .get("links")
            .cloned()
            .unwrap_or(Value::Array(Vec::new())),
        _ => bail!("links file must hold an array or a {{\"links\": [...]}} object"),
    };
    serde_json::from_value(links).context("links have unexpected shape")
}

fn run_extract(args: ExtractArgs) -> Result<i32> {
    let payload = fs::read_to_string(&args.payload)
        .with_context(|| format!("failed reading {}", args.payload.display()))?;

    let Some(answer) = extract_final_answer(&payload) else {
        eprintln!("no answer found in payload");
        return Ok(1);
    };
    let rendered = match decision_from_answer(&answer) {
        Some(Extraction::Navigate(decision)) => serde_json::to_string_pretty(&decision)?,
        Some(Extraction::Commentary(commentary)) => {
            serde_json::to_string_pretty(&json!({"commentary": commentary}))?
        }
        None => serde_json::to_string_pretty(&json!({"answer": answer}))?,
    };
    println!("{rendered}");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::parse_links;

    #[test]
    fn parse_links_accepts_both_shapes() -> anyhow::Result<()> {
        let bare = r#"[{"panoId": "A", "heading": 10}]"#;
        let wrapped = r#"{"links": [{"panoId": "A", "heading": 10}], "count": 1}"#;

        let from_bare = parse_links(bare)?;
        let from_wrapped = parse_links(wrapped)?;
        assert_eq!(from_bare, from_wrapped);
        assert_eq!(from_bare[0].pano_id, "A");

        assert!(parse_links("42").is_err());
        Ok(())
    }
}
