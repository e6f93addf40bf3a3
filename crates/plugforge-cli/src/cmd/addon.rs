use crate::output::{print_json, print_table, yes_no};
use anyhow::Context;
use clap::Subcommand;
use plugforge_core::addon::{self, Addon, Answers, Question, QuestionKind};
use plugforge_core::ForgeError;
use std::io::{BufRead, Write};
use std::path::Path;

#[derive(Subcommand)]
pub enum AddonSubcommand {
    /// Enable an add-on
    Enable {
        #[arg(short, long)]
        name: String,
    },
    /// Disable an add-on
    Disable {
        #[arg(short, long)]
        name: String,
    },
    /// List add-ons and their status
    List,
    /// Mark an add-on to be installed by deployments
    Install {
        #[arg(short, long)]
        name: String,
    },
    /// Mark an add-on as configuration only (not installed by deployments)
    ConfigOnly {
        #[arg(short, long)]
        name: String,
    },
    /// Configure one add-on, or every add-on when no name is given
    Configure {
        name: Option<String>,
        /// Answer a question non-interactively (KEY=VALUE, repeatable).
        /// Requires an add-on name.
        #[arg(long = "set", value_parser = parse_answer, requires = "name")]
        answers: Vec<(String, String)>,
    },
}

fn parse_answer(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

pub fn run(root: &Path, subcmd: AddonSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AddonSubcommand::Enable { name } => toggle(root, &name, true, json),
        AddonSubcommand::Disable { name } => toggle(root, &name, false, json),
        AddonSubcommand::List => list(root, json),
        AddonSubcommand::Install { name } => mark(root, &name, false, json),
        AddonSubcommand::ConfigOnly { name } => mark(root, &name, true, json),
        AddonSubcommand::Configure { name, answers } => {
            configure(root, name.as_deref(), answers.into_iter().collect(), json)
        }
    }
}

fn toggle(root: &Path, name: &str, enabled: bool, json: bool) -> anyhow::Result<()> {
    let changed = addon::update(root, name, |a| Ok(a.set_enabled(enabled)))
        .with_context(|| format!("unable to update add-on '{name}'"))?;
    let state = if enabled { "enabled" } else { "disabled" };
    if json {
        print_json(&serde_json::json!({ "name": name, "enabled": enabled, "changed": changed }))?;
    } else if changed {
        println!("Add-on {name} {state}");
    } else {
        println!("Add-on {name} already {state}");
    }
    Ok(())
}

fn mark(root: &Path, name: &str, config_only: bool, json: bool) -> anyhow::Result<()> {
    addon::update(root, name, |a| {
        a.config_only = config_only;
        Ok(())
    })
    .with_context(|| format!("unable to update add-on '{name}'"))?;
    if json {
        print_json(&serde_json::json!({ "name": name, "config_only": config_only }))?;
    } else if config_only {
        println!("Add-on {name} marked as configuration only");
    } else {
        println!("Add-on {name} marked for install");
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let addons = addon::load(root).context("unable to load add-ons")?;
    if json {
        return print_json(&addons);
    }
    let rows: Vec<Vec<String>> = addons
        .iter()
        .map(|a| {
            let status = a
                .settings()
                .map(|s| s.status().to_string())
                .unwrap_or_else(|e| format!("invalid ({e})"));
            vec![
                a.name.clone(),
                a.kind.to_string(),
                yes_no(a.enabled),
                yes_no(a.config_only),
                status,
            ]
        })
        .collect();
    print_table(&["NAME", "KIND", "ENABLED", "CONFIG-ONLY", "STATUS"], &rows);
    Ok(())
}

fn configure(root: &Path, name: Option<&str>, preset: Answers, json: bool) -> anyhow::Result<()> {
    let mut addons = addon::load(root).context("unable to load add-ons")?;
    let targets: Vec<usize> = match name {
        Some(name) => vec![addons
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| ForgeError::AddonNotFound(name.to_string()))?],
        None => (0..addons.len()).collect(),
    };

    let interactive = preset.is_empty();
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    for i in targets {
        let answers = if interactive {
            ask(&addons[i], &mut input)?
        } else {
            preset.clone()
        };
        let settings = addon::apply(&addons[i], &answers)
            .with_context(|| format!("unable to configure add-on '{}'", addons[i].name))?;
        if !json {
            println!("{}: {}", addons[i].name, settings.status());
        }
        addons[i].configure(settings);
    }
    addon::save(root, &addons).context("failed to write addons.json")?;

    if json {
        print_json(&addons)?;
    }
    Ok(())
}

/// Prompt for every applicable question on stderr and read answers from
/// `input`. An empty line keeps the default.
fn ask(addon: &Addon, input: &mut impl BufRead) -> anyhow::Result<Answers> {
    let mut answers = Answers::new();
    for question in addon::questions(addon) {
        if !question.applies(&answers) {
            continue;
        }
        eprint!("{}", prompt_text(&question));
        std::io::stderr().flush()?;
        let mut line = String::new();
        input.read_line(&mut line)?;
        let line = line.trim();
        match (line.is_empty(), &question.default) {
            (false, _) => {
                answers.insert(question.key.clone(), line.to_string());
            }
            (true, Some(default)) => {
                answers.insert(question.key.clone(), default.clone());
            }
            (true, None) => {}
        }
    }
    Ok(answers)
}

fn prompt_text(question: &Question) -> String {
    let hint = match &question.kind {
        QuestionKind::Choice { options } => format!(" [{}]", options.join("/")),
        QuestionKind::YesNo => " [yes/no]".to_string(),
        QuestionKind::Port => " (0-65535)".to_string(),
        QuestionKind::Text => String::new(),
    };
    match &question.default {
        Some(default) => format!("{}{hint} ({default}): ", question.prompt),
        None => format!("{}{hint}: ", question.prompt),
    }
}
