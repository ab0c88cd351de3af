use anyhow::Result;
use clap::Command;
use clap_complete::{Shell, generate};
use std::io::{self, Write};

/// Print the completion script for `shell`
pub fn execute(shell: Shell, cmd: &mut Command) -> Result<()> {
    write_completions(shell, cmd, &mut io::stdout().lock())
}

pub fn write_completions(shell: Shell, cmd: &mut Command, out: &mut dyn Write) -> Result<()> {
    let bin_name = cmd.get_name().to_string();
    generate(shell, cmd, bin_name, out);
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uses_command_name() {
        let mut cmd = Command::new("skua").subcommand(Command::new("proxy"));
        let mut out = Vec::new();
        write_completions(Shell::Bash, &mut cmd, &mut out).unwrap();

        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("_skua()"));
        assert!(script.contains("proxy"));
    }
}
