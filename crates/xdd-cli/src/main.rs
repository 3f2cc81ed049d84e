use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use xdd::Reporter;
use xdd::config::{self, XddConfig};
use xdd::generator::{OpenRouterClient, OutputShape, StructuredGenerator};
use xdd::ident;
use xdd::lock::LockInterface;
use xdd::replay::replay;
use xdd::repository::SpecsRepository;
use xdd::types::{
    AcceptanceCriterion, ChangelogEvent, CriterionBody, EarsClass, EventKind, Priority,
    ProjectMetadata, Requirement, Specification,
};

#[derive(Parser, Debug)]
#[command(name = "xdd", version)]
#[command(about = "Conversational specification authoring over an event-sourced YAML store")]
struct Cli {
    /// Project root (the artifact directory lives under it)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to a config file (default: <root>/xdd.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Artifact directory name under the project root (overrides the config)
    #[arg(long)]
    artifact_dir: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a project: record its name and description.
    Init {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
    },
    /// Run an interactive authoring session against the configured LLM.
    Specify,
    /// Print project metadata and store statistics.
    Status,
    /// Remove the artifact lock left behind by a crashed process.
    Unlock {
        /// Required: unconditionally delete the lock file.
        #[arg(long)]
        force: bool,
    },
    /// Produce a design from the committed specification (later stage).
    Design,
    /// Break the design down into tasks (later stage).
    Tasks,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config(&cli.root)?,
    };
    if let Some(dir) = &cli.artifact_dir {
        cfg.artifact_dir = dir.clone();
    }
    let repo = SpecsRepository::with_options(
        cfg.artifact_root(&cli.root),
        cfg.repository_options(),
    );
    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Init { name, description } => run_init(&repo, &mut reporter, name, description),
        Commands::Specify => run_specify(&repo, &cfg, &mut reporter),
        Commands::Status => run_status(&repo, &mut reporter),
        Commands::Unlock { force } => {
            if !force {
                bail!("unlock is destructive; pass --force to remove the lock file");
            }
            repo.force_unlock(&mut reporter)
        }
        Commands::Design => bail!("the design stage is not implemented yet"),
        Commands::Tasks => bail!("the tasks stage is not implemented yet"),
    }
}

fn run_init(
    repo: &SpecsRepository,
    reporter: &mut CliReporter,
    name: String,
    description: String,
) -> Result<()> {
    repo.safe_operation(LockInterface::Cli, reporter, |txn, reporter| {
        let current = repo.read_specification(reporter)?;
        let now = Utc::now();
        let event = ChangelogEvent {
            event_id: ident::new_event_id(),
            timestamp: now,
            kind: EventKind::ProjectMetadataUpdated {
                old_metadata: current.metadata.clone(),
                new_metadata: ProjectMetadata {
                    name: name.clone(),
                    description: description.clone(),
                    version: current.metadata.version.clone(),
                    created_at: if current.metadata.name.is_empty() {
                        now
                    } else {
                        current.metadata.created_at
                    },
                    updated_at: now,
                },
            },
        };
        let events = vec![event];
        let next = replay(current, &events)?;
        repo.stage(txn, &next, &events, reporter)
    })?;
    println!("initialized project {name}");
    Ok(())
}

fn run_status(repo: &SpecsRepository, reporter: &mut CliReporter) -> Result<()> {
    let spec = repo.read_specification(reporter)?;
    if spec.metadata.name.is_empty() {
        println!("project: (uninitialized)");
    } else {
        println!("project: {}", spec.metadata.name);
        println!("description: {}", spec.metadata.description);
    }
    println!("version: {}", spec.metadata.version);
    println!("requirements: {}", spec.requirements.len());
    println!("categories: {}", spec.categories.join(", "));

    if let Some(log) = xdd::changelog::load_changelog(repo.root())? {
        println!("events: {}", log.events.len());
        println!("events since snapshot: {}", log.events_since_snapshot);
        if log.last_snapshot.is_empty() {
            println!("last snapshot: (none)");
        } else {
            println!("last snapshot: {}", log.last_snapshot);
        }
    } else {
        println!("events: 0");
    }
    Ok(())
}

const REQUIREMENT_SHAPE_KEYS: [&str; 6] = [
    "category",
    "ears",
    "description",
    "rationale",
    "priority",
    "acceptance_criteria",
];

fn requirement_prompt(spec: &Specification, request: &str) -> String {
    format!(
        "You are authoring EARS-formatted software requirements.\n\
         Existing categories: [{}].\n\
         Turn the following request into ONE requirement, answering with a JSON object\n\
         with keys: category (uppercase alphanumeric, 1-20 chars), ears (one of\n\
         ubiquitous|event|state|optional), description (EARS sentence, 10-500 chars),\n\
         rationale (10-500 chars), priority (critical|high|medium|low), and\n\
         acceptance_criteria (1-10 items; each either {{\"type\": \"behavioral\",\n\
         \"given\": ..., \"when\": ..., \"then\": ...}} or {{\"type\": \"assertion\",\n\
         \"statement\": ...}}, strings up to 200 chars).\n\
         Request: {request}",
        spec.categories.join(", ")
    )
}

/// Build a typed requirement out of the generator's JSON, minting fresh
/// identifiers along the way. Field validation happens in the reducer.
fn requirement_from_value(value: &serde_json::Value) -> Result<Requirement> {
    let str_field = |key: &str| -> Result<String> {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .with_context(|| format!("generator output is missing string field {key:?}"))
    };

    let category = str_field("category")?;
    let ears = match str_field("ears")?.as_str() {
        "ubiquitous" => EarsClass::Ubiquitous,
        "event" => EarsClass::Event,
        "state" => EarsClass::State,
        "optional" => EarsClass::Optional,
        other => bail!("generator produced unknown EARS class {other:?}"),
    };
    let priority = match str_field("priority")?.as_str() {
        "critical" => Priority::Critical,
        "high" => Priority::High,
        "medium" => Priority::Medium,
        "low" => Priority::Low,
        other => bail!("generator produced unknown priority {other:?}"),
    };

    let now = Utc::now();
    let raw_criteria = value
        .get("acceptance_criteria")
        .and_then(|v| v.as_array())
        .context("generator output is missing acceptance_criteria")?;
    let mut acceptance_criteria = Vec::new();
    for raw in raw_criteria {
        let kind = raw.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        let text = |key: &str| -> Result<String> {
            raw.get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .with_context(|| format!("criterion is missing field {key:?}"))
        };
        let body = match kind {
            "behavioral" => CriterionBody::Behavioral {
                given: text("given")?,
                when: text("when")?,
                then: text("then")?,
            },
            "assertion" => CriterionBody::Assertion {
                statement: text("statement")?,
            },
            other => bail!("generator produced unknown criterion type {other:?}"),
        };
        acceptance_criteria.push(AcceptanceCriterion {
            id: ident::new_criterion_id(),
            created_at: now,
            body,
        });
    }

    Ok(Requirement {
        id: ident::new_requirement_id(&category)?,
        ears,
        category,
        description: str_field("description")?,
        rationale: str_field("rationale")?,
        acceptance_criteria,
        priority,
        created_at: now,
    })
}

fn run_specify(repo: &SpecsRepository, cfg: &XddConfig, reporter: &mut CliReporter) -> Result<()> {
    let client = OpenRouterClient::from_env(&cfg.generator)?;
    if !client.has_api_key() {
        bail!(
            "no API key found; set {} before running specify",
            cfg.generator.api_key_env
        );
    }

    let shape = OutputShape::object(REQUIREMENT_SHAPE_KEYS);
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("requirement> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next() else { break };
        let request = line.context("failed to read stdin")?;
        let request = request.trim();
        if request.is_empty() {
            continue;
        }
        if request == "done" || request == "quit" {
            break;
        }

        // The LLM call happens outside the lock; only the commit is guarded.
        let spec = repo.read_specification(reporter)?;
        let value = match client.generate(&requirement_prompt(&spec, request), &shape) {
            Ok(value) => value,
            Err(e) => {
                // Generation failures leave the store untouched; stay in the loop.
                reporter.error(&format!("generation failed: {e}"));
                continue;
            }
        };
        let requirement = match requirement_from_value(&value) {
            Ok(requirement) => requirement,
            Err(e) => {
                reporter.error(&format!("generator output rejected: {e:#}"));
                continue;
            }
        };

        let id = requirement.id.clone();
        let events = vec![ChangelogEvent {
            event_id: ident::new_event_id(),
            timestamp: Utc::now(),
            kind: EventKind::RequirementAdded { requirement },
        }];
        repo.safe_operation(LockInterface::Cli, reporter, |txn, reporter| {
            let current = repo.read_specification(reporter)?;
            let next = replay(current, &events)?;
            repo.stage(txn, &next, &events, reporter)
        })?;
        println!("committed {id}");
    }
    Ok(())
}
