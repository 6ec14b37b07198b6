use anyhow::{Context, Result};
use clap::Parser;
use sqlrunner_core::{describe_record_batch, sample_record_batch, RunnerConfig, SqlRunner};

const DEFAULT_SQL: &str = "SELECT * FROM {{.Table}}";

#[derive(Parser, Debug)]
#[command(name = "sqlrunner")]
#[command(about = "Run SQL over an Arrow record batch with embedded DuckDB", long_about = None)]
struct Cli {
    /// SQL statement to run; repeat for a sequence. Only the last statement's
    /// rows are printed. `{{.Table}}` names the ingested batch.
    #[arg(short, long = "sql", value_name = "SQL")]
    sql: Vec<String>,

    /// Database path (default: in-memory)
    #[arg(long, default_value = ":memory:")]
    path: String,

    /// Always ingest into `source_table` instead of a per-call name
    #[arg(long)]
    fixed_table_name: bool,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let log_format = std::env::var("SQLRUNNER_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let statements = if cli.sql.is_empty() {
        vec![DEFAULT_SQL.to_string()]
    } else {
        cli.sql
    };

    let record = sample_record_batch();
    println!("Record before running SQL:");
    print!("{}", describe_record_batch(&record));

    let config = RunnerConfig::builder()
        .path(cli.path)
        .unique_table_names(!cli.fixed_table_name)
        .build();
    let mut runner = SqlRunner::new(config).context("failed to open sql runner")?;
    let results = runner
        .run_sql_on_record(&record, statements.as_slice())
        .context("failed to run SQL on record")?;

    for batch in &results {
        print!("{}", describe_record_batch(batch));
    }
    runner.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_runs_default_statement() {
        let cli = Cli::try_parse_from(["sqlrunner"]).unwrap();
        assert!(cli.sql.is_empty());
        assert_eq!(cli.path, ":memory:");
        assert!(!cli.fixed_table_name);
    }

    #[test]
    fn sql_flag_repeats_in_order() {
        let cli = Cli::try_parse_from([
            "sqlrunner",
            "--sql",
            "CREATE TABLE t AS SELECT * FROM {{.Table}}",
            "-s",
            "SELECT * FROM t",
            "--fixed-table-name",
        ])
        .unwrap();
        assert_eq!(
            cli.sql,
            vec!["CREATE TABLE t AS SELECT * FROM {{.Table}}", "SELECT * FROM t"]
        );
        assert!(cli.fixed_table_name);
    }
}
