use assert_cmd::Command;
use predicates::prelude::*;

fn skua() -> Command {
    Command::cargo_bin("skua").unwrap()
}

#[test]
fn test_completion_help_lists_shells_and_installation() {
    skua()
        .args(["completion", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUPPORTED SHELLS"))
        .stdout(predicate::str::contains("INSTALLATION"))
        .stdout(predicate::str::contains("~/.zshrc"));
}

#[test]
fn test_completion_scripts_name_the_binary() {
    for (shell, marker) in [
        ("bash", "complete -F _skua"),
        ("zsh", "#compdef skua"),
        ("fish", "complete -c skua"),
        ("powershell", "-CommandName 'skua'"),
    ] {
        skua()
            .args(["completion", "--shell", shell])
            .assert()
            .success()
            .stdout(predicate::str::contains(marker));
    }
}

#[test]
fn test_completion_rejects_unknown_shell() {
    skua()
        .args(["completion", "--shell", "tcsh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_completion_requires_shell() {
    skua()
        .arg("completion")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}
