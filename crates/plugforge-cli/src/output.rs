use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print rows as left-aligned columns under a dashed header.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .filter_map(|r| r.get(i))
                .map(|c| c.chars().count())
                .fold(h.len(), usize::max)
        })
        .collect();

    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", render_line(headers.iter().copied(), &widths));
    println!("{}", render_line(dashes.iter().map(String::as_str), &widths));
    for row in rows {
        println!("{}", render_line(row.iter().map(String::as_str), &widths));
    }
}

fn render_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:width$}"))
        .collect();
    padded.join("  ").trim_end().to_string()
}

/// `yes`/`no` for boolean table cells.
pub fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}
