//! Terminal output helpers

use console::style;

/// Print a progress step line.
pub fn step(message: &str) {
    println!("{} {message}", style("→").blue().bold());
}

/// Print a success line.
pub fn success(message: &str) {
    println!("{} {message}", style("✓").green().bold());
}

/// Print the closing `service -> URL` connection table.
pub fn connect_table(rows: &[(String, String)]) {
    if rows.is_empty() {
        return;
    }
    println!();
    println!("{}", style("Connections:").bold());
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, url) in rows {
        println!("  {:width$}  {}", style(name).cyan(), url, width = width);
    }
}

/// Ask for confirmation on the terminal, unless `--confirm` was passed.
pub fn confirmed(prompt: &str, skip: bool) -> std::io::Result<bool> {
    if skip {
        return Ok(true);
    }
    let term = console::Term::stderr();
    if !term.is_term() {
        // Non-interactive runs must pass --confirm explicitly.
        return Ok(false);
    }
    term.write_str(&format!("{prompt} [y/N] "))?;
    let answer = term.read_line()?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
