use crate::output::print_json;
use anyhow::Context;
use plugforge_core::clean;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let removed = clean::clean(root)
        .with_context(|| format!("unable to clean {}", root.display()))?;

    if json {
        return print_json(&removed);
    }
    if removed.is_empty() {
        println!("Nothing to clean");
    }
    for path in &removed {
        let shown = path.strip_prefix(root).unwrap_or(path);
        println!("removed {}", shown.display());
    }
    Ok(())
}
