use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

fn editor_command() -> String {
    std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string())
}

pub fn jump_args(editor: &str, file: &Path, line: u32) -> Vec<String> {
    let name = Path::new(editor)
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let file = file.to_string_lossy();

    match name.as_str() {
        "code" | "codium" | "code-insiders" => vec!["-g".to_string(), format!("{file}:{line}")],
        "subl" | "zed" => vec![format!("{file}:{line}")],
        _ => vec![format!("+{line}"), file.into_owned()],
    }
}

pub fn open_in_editor(file: &Path, line: u32) -> Result<()> {
    let raw = editor_command();
    let mut parts = raw.split_whitespace();
    let program = parts.next().context("Editor command is empty")?.to_string();
    let mut args: Vec<String> = parts.map(str::to_string).collect();
    args.extend(jump_args(&program, file, line));

    debug!(editor = %program, ?args, "launching editor");
    let spawned = Command::new(&program)
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn();

    match spawned {
        Ok(_child) => Ok(()),
        Err(e) => {
            warn!(editor = %program, error = %e, "failed to launch editor");
            Err(anyhow::Error::new(e).context(format!("Failed to execute editor `{program}`")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_args_follow_editor_conventions() {
        let file = Path::new("app/models/user.rb");
        assert_eq!(
            jump_args("/usr/bin/nvim", file, 12),
            vec!["+12", "app/models/user.rb"]
        );
        assert_eq!(
            jump_args("code", file, 3),
            vec!["-g", "app/models/user.rb:3"]
        );
        assert_eq!(jump_args("subl", file, 7), vec!["app/models/user.rb:7"]);
    }
}
