//! Remove command - tear down a previously deployed bundle

use console::style;
use miette::{IntoDiagnostic, Result};

use crate::display;

pub async fn run(name: &str, confirm: bool) -> Result<()> {
    if !display::confirmed(
        &format!("Remove bundle '{name}' and all its releases?"),
        confirm,
    )
    .into_diagnostic()?
    {
        return Err(miette::miette!(
            "remove not confirmed; pass --confirm for non-interactive runs"
        ));
    }

    airlift_deploy::remove(name).await.into_diagnostic()?;
    display::success(&format!("Removed bundle {}", style(name).cyan()));
    Ok(())
}
