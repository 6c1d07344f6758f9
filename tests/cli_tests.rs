//! CLI Integration Tests for Chunkwise
//!
//! Tests the command-line interface including:
//! - Argument parsing with clap
//! - Settings management (`config init/show/set`)
//! - Document loading errors
//! - Missing API key handling
//!
//! No test reaches the network: every run that gets past argument parsing
//! fails before the first model call.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn chunkwise_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_chunkwise"))
}

/// Run the binary with an isolated settings directory and no API key
fn run(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(chunkwise_binary())
        .args(args)
        .env("CHUNKWISE_DIR", config_dir)
        .env("ANTHROPIC_API_KEY", "")
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute chunkwise")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

// ============================================================================
// Argument Parsing Tests
// ============================================================================

mod arg_parsing {
    use super::*;

    #[test]
    fn test_help_lists_subcommands() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &["--help"]);
        let out = stdout(&output);

        assert!(output.status.success());
        for command in ["analyze", "ask", "summarize", "config"] {
            assert!(out.contains(command), "help should list {}", command);
        }
        assert!(out.contains("--output-format"));
    }

    #[test]
    fn test_version_flag() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &["--version"]);
        assert!(output.status.success());
        assert!(stdout(&output).contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &[]);
        assert!(!output.status.success());
    }

    #[test]
    fn test_ask_requires_question() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &["ask", "doc.md"]);
        assert!(!output.status.success());
        assert!(stderr(&output).contains("QUESTION") || stderr(&output).contains("question"));
    }

    #[test]
    fn test_invalid_output_format_rejected() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &["analyze", "doc.md", "-o", "yaml"]);
        assert!(!output.status.success());
        assert!(stderr(&output).contains("yaml"));
    }
}

// ============================================================================
// Settings Tests
// ============================================================================

mod settings {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &["config", "init"]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let content = fs::read_to_string(temp.path().join("config.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["max_tokens"], 4096);
    }

    #[test]
    fn test_config_init_twice_fails() {
        let temp = TempDir::new().unwrap();
        assert!(run(temp.path(), &["config", "init"]).status.success());

        let output = run(temp.path(), &["config", "init"]);
        assert!(!output.status.success());
        assert!(stderr(&output).contains("already exists"));
    }

    #[test]
    fn test_config_set_then_show() {
        let temp = TempDir::new().unwrap();
        let set = run(temp.path(), &["config", "set", "model", "claude-haiku-4"]);
        assert!(set.status.success(), "stderr: {}", stderr(&set));

        let show = run(temp.path(), &["config", "show"]);
        assert!(show.status.success());
        assert!(stdout(&show).contains("claude-haiku-4"));
    }

    #[test]
    fn test_config_show_masks_api_key() {
        let temp = TempDir::new().unwrap();
        let set = run(temp.path(), &["config", "set", "api_key", "sk-ant-secret-value"]);
        assert!(set.status.success());

        let show = stdout(&run(temp.path(), &["config", "show"]));
        assert!(!show.contains("secret-value"));
        assert!(show.contains("***"));
    }

    #[test]
    fn test_config_set_unknown_key_fails() {
        let temp = TempDir::new().unwrap();
        let output = run(temp.path(), &["config", "set", "colour", "blue"]);
        assert!(!output.status.success());
        assert!(stderr(&output).contains("colour"));
    }
}

// ============================================================================
// Error Handling Tests
// ============================================================================

mod errors {
    use super::*;

    #[test]
    fn test_missing_document_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.md");
        let output = run(temp.path(), &["analyze", missing.to_str().unwrap()]);

        assert!(!output.status.success());
        assert!(stderr(&output).contains("not found"));
    }

    #[test]
    fn test_unsupported_extension_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("slides.pptx");
        fs::write(&path, "binary-ish").unwrap();

        let output = run(temp.path(), &["summarize", path.to_str().unwrap()]);
        assert!(!output.status.success());
        assert!(stderr(&output).contains("unsupported file type"));
    }

    #[test]
    fn test_missing_api_key_fails_before_any_call() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        fs::write(&path, "Some notes worth summarizing.").unwrap();

        let output = run(temp.path(), &["summarize", path.to_str().unwrap()]);
        assert!(!output.status.success());
        assert!(stderr(&output).contains("ANTHROPIC_API_KEY"));
        assert!(stdout(&output).is_empty());
    }
}
