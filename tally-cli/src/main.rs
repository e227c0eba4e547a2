//! CLI for the tally metering core.
//!
//! Provides commands for metering usage into a store, finding coverage gaps,
//! and building per-period reports from stored records.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tally::config::parse_interval;
use tally::meter::MeterRequest;
use tally::prometheus::{PrometheusBackend, PrometheusConfig};
use tally::{
    AggregationPolicy, BillingRecord, Meter, Range, Report, StoreUrl, find_gaps, open_store,
};
use tracing_subscriber::EnvFilter;

/// tally: Meter usage into billing records.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Meter the parts of a range not yet stored and write the records.
    Meter {
        /// Query to meter (a rate expression).
        query: String,

        /// Subject the usage is billed to.
        #[arg(long)]
        subject: String,

        /// How far back from now to meter (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "1h")]
        before: String,

        /// Maximum span of each metered record.
        #[arg(long, default_value = "10m")]
        max_period: String,

        /// Store URL (`file://<path>` or `s3://<bucket>/<prefix>`).
        #[arg(long)]
        store: String,

        /// Prometheus base URL.
        #[arg(long, default_value = "http://localhost:9090")]
        prometheus: String,

        /// Sampling step of the integration subquery.
        #[arg(long, default_value = "1m")]
        step: String,

        /// Extra HTTP header for Prometheus requests, as `name=value`.
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// Aggregate stored records into per-period totals.
    Report {
        /// Query whose records to report.
        query: String,

        /// Subject whose records to report.
        #[arg(long)]
        subject: String,

        /// How far back from now to report.
        #[arg(long, default_value = "1d")]
        before: String,

        /// Length of each reporting period.
        #[arg(long, default_value = "1h")]
        period: String,

        /// Label key distinguishing billable series (repeatable).
        #[arg(long = "merge-label")]
        merge_labels: Vec<String>,

        /// Store URL holding the raw records.
        #[arg(long)]
        store: String,

        /// Store URL to write the aggregated records to.
        #[arg(long)]
        output: Option<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// List the parts of a range not covered by stored records.
    Gaps {
        /// Query whose coverage to check.
        query: String,

        /// Subject whose coverage to check.
        #[arg(long)]
        subject: String,

        /// How far back from now to check.
        #[arg(long, default_value = "1d")]
        before: String,

        /// Store URL holding the records.
        #[arg(long)]
        store: String,
    },
}

/// Output format for report rows.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document with the records.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Meter {
            query,
            subject,
            before,
            max_period,
            store,
            prometheus,
            step,
            headers,
        } => cmd_meter(&MeterArgs {
            query,
            subject,
            before,
            max_period,
            store,
            prometheus,
            step,
            headers,
        }),
        Commands::Report {
            query,
            subject,
            before,
            period,
            merge_labels,
            store,
            output,
            format,
        } => cmd_report(
            &query,
            &subject,
            &before,
            &period,
            merge_labels,
            &store,
            output.as_deref(),
            &format,
        ),
        Commands::Gaps {
            query,
            subject,
            before,
            store,
        } => cmd_gaps(&query, &subject, &before, &store),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Arguments of `tally meter`.
struct MeterArgs {
    query: String,
    subject: String,
    before: String,
    max_period: String,
    store: String,
    prometheus: String,
    step: String,
    headers: Vec<String>,
}

/// Implements `tally meter <query>`.
fn cmd_meter(args: &MeterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let range = lookback(&args.before)?;
    let precision = parse_interval(&args.max_period)?;
    let store = open_store(&args.store.parse::<StoreUrl>()?)?;

    let mut config =
        PrometheusConfig::new(args.prometheus.as_str()).with_step(parse_interval(&args.step)?);
    for header in &args.headers {
        let (name, value) = header
            .split_once('=')
            .ok_or_else(|| format!("Header '{header}' must be name=value"))?;
        config = config.with_header(name.trim(), value.trim());
    }
    let meter = Meter::new(Box::new(PrometheusBackend::new(config)?));

    let request = MeterRequest::new(args.query.as_str(), args.subject.as_str(), range, precision);
    let report = meter.fill_gaps(store.as_ref(), &request)?;

    println!("Range: {range}");
    println!("Gaps metered: {}", report.gaps.len());
    for gap in &report.gaps {
        println!("  - {gap}");
    }
    println!("Records written: {}", report.records_written);
    Ok(())
}

/// Implements `tally report <query>`.
#[allow(clippy::too_many_arguments)]
fn cmd_report(
    query: &str,
    subject: &str,
    before: &str,
    period: &str,
    merge_labels: Vec<String>,
    store_url: &str,
    output: Option<&str>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let range = lookback(before)?;
    let period = parse_interval(period)?;
    let store = open_store(&store_url.parse::<StoreUrl>()?)?;
    let policy = AggregationPolicy { merge_labels };

    let report = Report::build(store.as_ref(), query, subject, &range, period, &policy)?;

    if let Some(output) = output {
        let output_store = open_store(&output.parse::<StoreUrl>()?)?;
        let written = report.write_to(output_store.as_ref())?;
        tracing::info!(output, written, "wrote aggregated records");
    }

    match format {
        OutputFormat::Csv => {
            println!("# query={query}, subject={subject}, records={}", report.records.len());
            println!("start,end,labels,amount");
            for record in &report.records {
                println!(
                    "{},{},{},{}",
                    rfc3339(record.start),
                    rfc3339(record.end),
                    csv_field(&format_labels(record)),
                    record.amount
                );
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "query": query,
                "subject": subject,
                "start": rfc3339(range.start()),
                "end": rfc3339(range.end()),
                "period_secs": report.period.num_seconds(),
                "total": report.total(),
                "records": report.records,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tally gaps <query>`.
fn cmd_gaps(
    query: &str,
    subject: &str,
    before: &str,
    store_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let range = lookback(before)?;
    let store = open_store(&store_url.parse::<StoreUrl>()?)?;

    let records = store.read(&range, query, subject)?;
    let gaps = find_gaps(&records, &range);

    println!("Range: {range}");
    println!("Stored records: {}", records.len());
    if gaps.is_empty() {
        println!("Fully covered");
        return Ok(());
    }

    let missing = gaps
        .iter()
        .fold(TimeDelta::zero(), |total, gap| total + gap.duration());
    println!("Gaps: {} ({}s uncovered)", gaps.len(), missing.num_seconds());
    for gap in &gaps {
        println!("  - {gap}");
    }
    Ok(())
}

/// The range ending now (whole seconds) and reaching back `before`.
fn lookback(before: &str) -> Result<Range, Box<dyn std::error::Error>> {
    let lookback = parse_interval(before)?;
    Ok(Range::ending_at(Utc::now().trunc_subsecs(0), lookback)?)
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Formats labels as `key=value` pairs joined by `;`.
fn format_labels(record: &BillingRecord) -> String {
    record
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Quotes a CSV field when it contains a separator or quote.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
