use crate::commands::{
    load_table, parse_cube_args, print_metrics, print_ping, run_cube, run_query,
};
use crate::config::Config;
use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Cell, Color, Table as ComfyTable};
use cube_executor::CubeService;
use cube_storage::MemorySource;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Repl {
    config: Config,
    editor: DefaultEditor,
    service: Arc<CubeService>,
    source: Arc<MemorySource>,
    history_file: PathBuf,
}

/// What the loop should do after a line
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Exit,
}

impl Repl {
    pub fn new(config: Config, service: Arc<CubeService>, source: Arc<MemorySource>) -> Result<Self> {
        let history_file = Self::get_history_file()?;
        let mut editor = DefaultEditor::new()?;

        // Load history
        let _ = editor.load_history(&history_file);

        Ok(Self {
            config,
            editor,
            service,
            source,
            history_file,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        println!("{}", "Interactive Cube REPL".bright_green().bold());
        println!(
            "  {} - Show available commands, anything else is resolved as SQL",
            ".help".bright_cyan()
        );
        println!();

        loop {
            let prompt = format!("{} ", "cube>".bright_green().bold());
            let readline = self.editor.readline(&prompt);

            match readline {
                Ok(line) => {
                    let line = line.trim();

                    if line.is_empty() {
                        continue;
                    }

                    self.editor.add_history_entry(line)?;

                    match self.handle_input(line).await {
                        Ok(Flow::Exit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => eprintln!("{} {:#}", "Error:".bright_red().bold(), e),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "exit".bright_yellow());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {:?}", "Error:".bright_red().bold(), err);
                    break;
                }
            }
        }

        // Save history
        self.editor.save_history(&self.history_file)?;

        println!("{}", "Goodbye!".bright_cyan());
        Ok(())
    }

    async fn handle_input(&mut self, input: &str) -> Result<Flow> {
        if input.starts_with('.') {
            self.handle_command(input).await
        } else {
            let sql = input.trim_end_matches(';');
            run_query(&self.service, sql, &self.config).await?;
            Ok(Flow::Continue)
        }
    }

    async fn handle_command(&mut self, cmd: &str) -> Result<Flow> {
        let (name, args) = match cmd.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (cmd, ""),
        };

        match name {
            ".help" | ".h" => self.show_help(),
            ".quit" | ".exit" | ".q" => return Ok(Flow::Exit),
            ".metrics" => print_metrics(&self.service.metrics()),
            ".ping" => print_ping(&self.service.ping()),
            ".cube" => {
                let params = parse_cube_args(args)?;
                run_cube(&self.service, &params, &self.config).await?;
            }
            ".load" => self.load(args)?,
            ".tables" => self.show_tables(),
            ".invalidate" => {
                let removed = if args.is_empty() {
                    self.service.invalidate_all()
                } else {
                    self.service.invalidate_table(args)
                };
                println!("{} Invalidated {} cache entries", "✓".bright_green(), removed);
            }
            ".timing" => {
                self.config.show_timing = !self.config.show_timing;
                println!(
                    "Timing {}",
                    if self.config.show_timing { "on" } else { "off" }
                );
            }
            _ => {
                anyhow::bail!("Unknown command: {}. Type .help for available commands", name);
            }
        }
        Ok(Flow::Continue)
    }

    /// `.load <path> [name]`, the name defaults to the file stem
    fn load(&self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let path = PathBuf::from(parts.next().context("Usage: .load <path> [name]")?);
        let name = match parts.next() {
            Some(name) => name.to_string(),
            None => table_name_from_path(&path)?,
        };
        load_table(&self.source, &name, &path)?;
        Ok(())
    }

    fn show_tables(&self) {
        let tables = self.source.tables();
        if tables.is_empty() {
            println!("{}", "No tables loaded. Use .load <path> [name]".bright_yellow());
            return;
        }

        let mut table = ComfyTable::new();
        table.set_header(vec![
            Cell::new("Table").fg(Color::Cyan),
            Cell::new("Rows").fg(Color::Green),
        ]);
        for (name, rows) in tables {
            table.add_row(vec![name, rows.to_string()]);
        }
        println!("{}", table);
    }

    fn show_help(&self) {
        println!("{}", "Available Commands:".bright_green().bold());
        println!();
        println!("{}", "  Meta Commands:".bright_yellow());
        println!("    {}  - Show this help", ".help".bright_cyan());
        println!("    {}  - Exit the REPL", ".quit".bright_cyan());
        println!("    {} - Toggle timing output", ".timing".bright_cyan());
        println!();
        println!("{}", "  Data:".bright_yellow());
        println!(
            "    {} - Register a CSV file with the source",
            ".load <path> [name]".bright_cyan()
        );
        println!("    {} - List source tables", ".tables".bright_cyan());
        println!();
        println!("{}", "  Cache:".bright_yellow());
        println!(
            "    {} - Resolve a cube request",
            ".cube <dims> [metric] [where <filters>]".bright_cyan()
        );
        println!("    {} - Show cache metrics", ".metrics".bright_cyan());
        println!("    {} - Health check", ".ping".bright_cyan());
        println!(
            "    {} - Drop cached entries",
            ".invalidate [table]".bright_cyan()
        );
        println!();
        println!("{}", "  SQL Examples:".bright_yellow());
        println!("    SELECT p1, SUM(count) FROM facts_agg GROUP BY p1");
        println!("    SELECT p1, p2, MAX(count) FROM facts_agg WHERE p3 = 1 GROUP BY p1, p2");
        println!();
    }

    fn get_history_file() -> Result<PathBuf> {
        let home = home::home_dir().context("Could not find home directory")?;
        let history_dir = home.join(".cubeproxy");
        std::fs::create_dir_all(&history_dir)?;
        Ok(history_dir.join("history.txt"))
    }
}

fn table_name_from_path(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a table name from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_from_path() {
        assert_eq!(
            table_name_from_path(Path::new("data/facts_agg.csv")).unwrap(),
            "facts_agg"
        );
        assert!(table_name_from_path(Path::new("/")).is_err());
    }
}
