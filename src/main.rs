use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;

use alphaevolve::archive::{Archive, ProgramId};
use alphaevolve::blocks;
use alphaevolve::config::Config;
use alphaevolve::external::command::CommandEvaluator;
use alphaevolve::external::openai::ChatProposer;
use alphaevolve::logging::{log, obj, v_str, Domain, Level};
use alphaevolve::orchestrator::{Orchestrator, OrchestratorConfig};

fn usage() {
    println!("alphaevolve - evolve trading strategy programs\n");
    println!("Commands:");
    println!("  seed <file>           - Store and evaluate a root program");
    println!("  evolve [cycles]       - Run evolution cycles (default 10)");
    println!("  top [k] [metric]      - Show the hall of fame");
    println!("  show <id>             - Print a program and its evaluations");
    println!("  lineage <id>          - Print a program's ancestry");
    println!("  blocks <file>         - List the evolve blocks in a file");
    println!("\nConfiguration is read from the environment (OPENAI_API_KEY, SQLITE_DB, HOF_METRIC, EVAL_CMD, ...).");
}

fn parse_id(arg: Option<&String>) -> Result<ProgramId> {
    let raw = arg.ok_or_else(|| anyhow!("missing program id"))?;
    raw.parse().with_context(|| format!("invalid program id: {}", raw))
}

fn build_orchestrator(cfg: &Config, archive: Arc<Archive>) -> Result<Orchestrator> {
    let evaluator = CommandEvaluator::from_config(cfg).map_err(|e| anyhow!(e))?;
    Ok(Orchestrator::new(
        archive,
        Arc::new(ChatProposer::new(cfg).map_err(|e| anyhow!(e))?),
        Arc::new(evaluator),
        OrchestratorConfig::from_config(cfg),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
        return Ok(());
    }
    let cmd = args[1].as_str();

    if cmd == "blocks" {
        let path = args.get(2).ok_or_else(|| anyhow!("usage: alphaevolve blocks <file>"))?;
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        for id in blocks::block_ids(&text) {
            println!("{}", id);
        }
        return Ok(());
    }

    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("command", v_str(cmd)),
            ("sqlite_db", v_str(&cfg.sqlite_db.to_string_lossy())),
            ("model", v_str(&cfg.openai_model)),
            ("metric", v_str(&cfg.hof_metric)),
            ("concurrency", json!(cfg.concurrency)),
        ]),
    );
    let archive = Arc::new(Archive::open(&cfg.sqlite_db)?);

    match cmd {
        "seed" => {
            let path = args.get(2).ok_or_else(|| anyhow!("usage: alphaevolve seed <file>"))?;
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            let orchestrator = build_orchestrator(&cfg, archive)?;
            let id = orchestrator.seed(&text).await?;
            println!("{}", id);
        }
        "evolve" => {
            if cfg.openai_api_key.is_none() {
                bail!("OPENAI_API_KEY is required for evolve");
            }
            let cycles: usize = match args.get(2) {
                Some(raw) => raw.parse().with_context(|| format!("invalid cycle count: {}", raw))?,
                None => 10,
            };
            let orchestrator = build_orchestrator(&cfg, archive)?;
            let summary = orchestrator
                .run_until(cycles, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            println!(
                "committed={} aborted={} halted={} cancelled={}",
                summary.committed, summary.aborted, summary.halted, summary.cancelled
            );
            if let Some((id, score)) = summary.best {
                println!("best {}={:.4} program={}", cfg.hof_metric, score, id);
            }
        }
        "top" => {
            let k: usize = match args.get(2) {
                Some(raw) => raw.parse().with_context(|| format!("invalid k: {}", raw))?,
                None => 10,
            };
            let metric = args.get(3).cloned().unwrap_or_else(|| cfg.hof_metric.clone());
            println!("{:<4} {:>8} {:>5} {:>8} {:>12}", "rank", "id", "gen", "parent", &metric);
            for (rank, entry) in archive.top(&metric, k)?.iter().enumerate() {
                let parent = entry
                    .program
                    .parent_id
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<4} {:>8} {:>5} {:>8} {:>12.4}",
                    rank + 1,
                    entry.program.id,
                    entry.program.generation,
                    parent,
                    entry.score
                );
            }
        }
        "show" => {
            let id = parse_id(args.get(2))?;
            let program = archive.get(id)?;
            println!(
                "# program {} generation {} parent {} sha256 {}",
                program.id,
                program.generation,
                program.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                program.text_hash
            );
            for record in archive.evaluations(id)? {
                println!("# evaluation {} {}", record.id, serde_json::to_string(&record.scores)?);
            }
            print!("{}", program.source_text);
        }
        "lineage" => {
            let id = parse_id(args.get(2))?;
            for program in archive.lineage(id)? {
                println!("{} gen={} sha256={}", program.id, program.generation, program.short_hash());
            }
        }
        other => {
            eprintln!("unknown command: {}\n", other);
            usage();
        }
    }
    Ok(())
}
