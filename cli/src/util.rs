use std::io::IsTerminal;

use anyhow::Result;
use serde::Serialize;

pub fn print_json<T: Serialize>(output: T) -> Result<()> {
    let output = if std::io::stdout().is_terminal() {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }?;

    println!("{output}");
    Ok(())
}
