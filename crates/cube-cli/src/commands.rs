use crate::config::Config;
use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use colored::Colorize;
use comfy_table::{Cell, Color, Table as ComfyTable};
use cube_executor::{CubeMetrics, CubeService, Ping, Resolution};
use cube_parser::CubeParams;
use cube_storage::{load_csv, MemorySource};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Split a `name=path` load spec
pub fn parse_load_spec(spec: &str) -> Result<(String, PathBuf)> {
    let (name, path) = spec
        .split_once('=')
        .filter(|(name, path)| !name.trim().is_empty() && !path.trim().is_empty())
        .with_context(|| format!("Invalid load spec '{}', expected name=path", spec))?;
    Ok((name.trim().to_string(), PathBuf::from(path.trim())))
}

pub fn load_table(source: &MemorySource, name: &str, path: &Path) -> Result<usize> {
    if !path.exists() {
        anyhow::bail!("File not found: {:?}", path);
    }
    let batch = load_csv(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let rows = batch.num_rows();
    source.register_table(name, batch)?;

    println!(
        "{} Loaded table '{}' ({} rows)",
        "✓".bright_green(),
        name.bright_cyan(),
        rows
    );
    Ok(rows)
}

pub async fn run_query(service: &CubeService, sql: &str, config: &Config) -> Result<()> {
    let start = Instant::now();
    let resolution = service.query_sql(sql).await?;
    print_resolution(&resolution, start, config);
    Ok(())
}

pub async fn run_cube(service: &CubeService, params: &CubeParams, config: &Config) -> Result<()> {
    let start = Instant::now();
    let resolution = service.query_cube(params).await?;
    print_resolution(&resolution, start, config);
    Ok(())
}

pub fn print_resolution(resolution: &Resolution, start: Instant, config: &Config) {
    let elapsed = start.elapsed();
    println!("{}", render_batch(&resolution.table, config.max_rows));

    let rows = resolution.table.num_rows();
    if rows > config.max_rows {
        println!(
            "{}",
            format!("... {} more rows", rows - config.max_rows).bright_black()
        );
    }

    let origin = if resolution.origin.is_cache_served() {
        resolution.origin.to_string().bright_green()
    } else {
        resolution.origin.to_string().bright_yellow()
    };
    print!("{} row(s), {}", rows, origin);
    if config.show_timing {
        print!(" in {:.2}ms", elapsed.as_secs_f64() * 1000.0);
    }
    println!();

    if let Some(reason) = &resolution.not_cached {
        println!("{} {}", "Not cached:".bright_yellow(), reason);
    }
}

/// Render at most `max_rows` rows as a table
pub fn render_batch(batch: &RecordBatch, max_rows: usize) -> ComfyTable {
    let mut table = ComfyTable::new();
    table.set_header(
        batch
            .schema()
            .fields()
            .iter()
            .map(|f| Cell::new(f.name()).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );

    for row in 0..batch.num_rows().min(max_rows) {
        let cells: Vec<String> = batch
            .columns()
            .iter()
            .map(|column| {
                if column.is_null(row) {
                    "NULL".to_string()
                } else {
                    array_value_to_string(column, row).unwrap_or_else(|_| "?".to_string())
                }
            })
            .collect();
        table.add_row(cells);
    }
    table
}

pub fn print_metrics(metrics: &CubeMetrics) {
    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("Metric").fg(Color::Cyan),
        Cell::new("Value").fg(Color::Green),
    ]);

    let last_persist = metrics
        .last_persist_ts
        .map(|ts| ts.to_string())
        .unwrap_or_else(|| "never".to_string());

    table.add_row(vec!["Tables cached".to_string(), metrics.tables_cached.to_string()]);
    table.add_row(vec!["Total rows".to_string(), metrics.total_rows.to_string()]);
    table.add_row(vec!["Cache hits".to_string(), metrics.cache_hits.to_string()]);
    table.add_row(vec!["Roll-up hits".to_string(), metrics.rollup_hits.to_string()]);
    table.add_row(vec!["Cache misses".to_string(), metrics.cache_misses.to_string()]);
    table.add_row(vec!["Evictions".to_string(), metrics.evictions.to_string()]);
    table.add_row(vec![
        "Persistence".to_string(),
        if metrics.persistent_enabled {
            metrics.persistent_path.display().to_string()
        } else {
            "disabled".to_string()
        },
    ]);
    table.add_row(vec!["Last persisted".to_string(), last_persist]);
    println!("{}", table);

    if !metrics.cache_keys.is_empty() {
        println!("{}", "Cache keys:".bright_yellow().bold());
        for key in &metrics.cache_keys {
            println!("  {}", key);
        }
    }
}

pub fn print_ping(ping: &Ping) {
    println!(
        "{} status={} cache_size={}",
        "✓".bright_green(),
        ping.status,
        ping.cache_size
    );
}

/// Parse `.cube` arguments: `<dims> [metric] [where <filters>]`
pub fn parse_cube_args(args: &str) -> Result<CubeParams> {
    let lower = args.to_ascii_lowercase();
    let (head, filters) = match lower.find(" where ") {
        Some(pos) => (&args[..pos], Some(args[pos + 7..].trim())),
        None => (args, None),
    };

    let mut parts = head.split_whitespace();
    let dims = parts
        .next()
        .context("Usage: .cube <dims> [metric] [where <filters>]")?;

    let mut params = CubeParams::from_dims_str(dims);
    if let Some(metric) = parts.next() {
        params = params.with_metric(metric);
    }
    if let Some(extra) = parts.next() {
        anyhow::bail!("Unexpected argument '{}'", extra);
    }
    if let Some(filters) = filters.filter(|f| !f.is_empty()) {
        params = params.with_filters(filters);
    }
    Ok(params)
}
