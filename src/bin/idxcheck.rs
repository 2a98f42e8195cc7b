//! Command-line front end: verify index files, or write sample ones.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use idxcheck::{
    primitives::pager::{FilePageStore, PageStore},
    storage::{
        btree::{BTreeBuildOptions, BTreeBuilder, BTreeIndex},
        compare::{BytewiseComparator, I64Comparator, KeyComparator},
        gist::{BoxKey, BoxOpClass, GistBuildOptions, GistBuilder, GistEntry, GistIndex},
        heap::{CsvTable, HeapRow},
    },
    types::{page::DEFAULT_PAGE_SIZE, CheckError, Corruption, RowId, TxId},
    verify::{self, BTreeReport, CheckOptions, Concern, GistReport},
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[path = "idxcheck/config.rs"]
mod config;
#[path = "idxcheck/ui.rs"]
mod ui;

use config::CliConfig;
use ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "idxcheck",
    version,
    about = "Online integrity verifier for B-Tree and GiST index files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_enum, help = "Output format for reports")]
    format: Option<OutputFormat>,

    #[arg(long, global = true, value_enum, help = "Color theme for text output")]
    theme: Option<Theme>,

    #[arg(
        long,
        global = true,
        env = "IDXCHECK_CONFIG",
        value_name = "FILE",
        help = "TOML config file (defaults to the user config directory)"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a B-Tree index file.
    Btree(BtreeCmd),
    /// Verify a GiST box index file.
    Gist(GistCmd),
    /// Write a well-formed sample index.
    #[command(subcommand)]
    Sample(SampleCmd),
}

#[derive(Args, Debug)]
struct BtreeCmd {
    #[arg(value_name = "FILE")]
    path: PathBuf,

    #[arg(long, help = "Exclude writers and run the parent/child checks")]
    strict: bool,

    #[arg(
        long,
        value_name = "CSV",
        help = "Table rows (key_hex,block,offset,xmin) to check for matching leaf entries"
    )]
    table: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ComparatorArg::Bytewise)]
    comparator: ComparatorArg,

    #[arg(long, help = "Fixed Bloom filter seed")]
    bloom_seed: Option<u64>,
}

#[derive(Args, Debug)]
struct GistCmd {
    #[arg(value_name = "FILE")]
    path: PathBuf,
}

#[derive(Subcommand, Debug)]
enum SampleCmd {
    /// Bulk-load ascending keys into a B-Tree file.
    Btree {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long, default_value_t = 1000)]
        rows: u32,
        #[arg(long, value_name = "CSV", help = "Also write the matching table")]
        table: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },
    /// Load a grid of points into a GiST file.
    Gist {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long, default_value_t = 1000)]
        rows: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ComparatorArg {
    Bytewise,
    I64,
}

impl ComparatorArg {
    fn comparator(self) -> Arc<dyn KeyComparator> {
        match self {
            ComparatorArg::Bytewise => Arc::new(BytewiseComparator),
            ComparatorArg::I64 => Arc::new(I64Comparator),
        }
    }
}

/// Exit status when the check found corruption.
const EXIT_CORRUPT: i32 = 2;

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let cfg = match CliConfig::load(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    let format = cli.format.or(cfg.format).unwrap_or(OutputFormat::Text);
    let ui = Ui::new(cli.theme.or(cfg.theme).unwrap_or(Theme::Auto));

    match run(cli.command, &cfg, format, &ui) {
        Ok(()) => {}
        Err(err) => match err.downcast::<CheckError>() {
            Ok(check) => match *check {
                CheckError::Corruption(corruption) => {
                    if let Err(err) = emit_corruption(format, &ui, &corruption) {
                        eprintln!("error: {err}");
                    }
                    std::process::exit(EXIT_CORRUPT);
                }
                other => {
                    eprintln!("error: {other}");
                    std::process::exit(1);
                }
            },
            Err(err) => {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("idxcheck=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn run(command: Command, cfg: &CliConfig, format: OutputFormat, ui: &Ui) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Btree(cmd) => {
            let mut opts = cfg.check.clone();
            opts.strict |= cmd.strict;
            opts.heapallindexed |= cmd.table.is_some();
            if let Some(seed) = cmd.bloom_seed {
                opts.bloom_seed = Some(seed);
            }
            let report = check_btree(&cmd, &opts)?;
            emit(format, &report, || print_btree_text(ui, &report))?;
        }
        Command::Gist(cmd) => {
            let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&cmd.path)?);
            let index = GistIndex::new(index_name(&cmd.path), store, BoxOpClass);
            let report = verify::check_graph_with_options(&index, &cfg.check)?;
            emit(format, &report, || print_gist_text(ui, &report))?;
        }
        Command::Sample(SampleCmd::Btree {
            path,
            rows,
            table,
            page_size,
        }) => {
            write_btree_sample(&path, rows, table.as_deref(), page_size)?;
            ui.success(&format!("wrote {rows} keys to {}", path.display()));
        }
        Command::Sample(SampleCmd::Gist {
            path,
            rows,
            page_size,
        }) => {
            write_gist_sample(&path, rows, page_size)?;
            ui.success(&format!("wrote {rows} points to {}", path.display()));
        }
    }
    Ok(())
}

fn index_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_owned())
}

fn check_btree(cmd: &BtreeCmd, opts: &CheckOptions) -> Result<BTreeReport, CheckError> {
    let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&cmd.path)?);
    let mut index = BTreeIndex::new(index_name(&cmd.path), store, cmd.comparator.comparator());
    if let Some(table) = &cmd.table {
        index = index.with_table(Arc::new(CsvTable::open(table)?));
    }
    verify::check_with_options(&index, opts)
}

fn sample_key(i: u32) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}

fn write_btree_sample(path: &Path, rows: u32, table: Option<&Path>, page_size: u32) -> Result<(), CheckError> {
    let store = FilePageStore::create(path, page_size)?;
    let opts = BTreeBuildOptions {
        page_size,
        ..Default::default()
    };
    let entries = (0..rows)
        .map(|i| (sample_key(i), RowId::new(i / 64, (i % 64 + 1) as u16)))
        .collect();
    BTreeBuilder::new(&store, opts)?.build(entries, &BytewiseComparator)?;
    if let Some(table) = table {
        let heap: Vec<HeapRow> = (0..rows)
            .map(|i| HeapRow {
                row: RowId::new(i / 64, (i % 64 + 1) as u16),
                key: sample_key(i),
                created_by: TxId(1),
            })
            .collect();
        CsvTable::write(table, &heap)?;
    }
    Ok(())
}

fn write_gist_sample(path: &Path, rows: u32, page_size: u32) -> Result<(), CheckError> {
    let store = FilePageStore::create(path, page_size)?;
    let opts = GistBuildOptions {
        page_size,
        ..Default::default()
    };
    let side = (f64::from(rows)).sqrt().ceil().max(1.0) as u32;
    let entries = (0..rows)
        .map(|i| GistEntry {
            attrs: vec![Some(BoxKey::point(f64::from(i % side), f64::from(i / side)))],
            row: RowId::new(i / 64, (i % 64 + 1) as u16),
        })
        .collect();
    GistBuilder::new(&store, &BoxOpClass, opts)?.build(entries)?;
    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, text: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Text => text(),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn emit_corruption(format: OutputFormat, ui: &Ui, corruption: &Corruption) -> Result<(), Box<dyn Error>> {
    #[derive(Serialize)]
    struct Failed<'a> {
        corrupt: bool,
        corruption: &'a Corruption,
    }
    emit(
        format,
        &Failed {
            corrupt: true,
            corruption,
        },
        || {
            ui.failure(&corruption.message);
            let mut rows = vec![("kind", format!("{:?}", corruption.kind)), ("index", corruption.index.clone())];
            if let Some(page) = corruption.page {
                rows.push(("page", page.to_string()));
            }
            if let Some(lsn) = corruption.lsn {
                rows.push(("lsn", lsn.to_string()));
            }
            if !corruption.items.is_empty() {
                let items: Vec<String> = corruption.items.iter().map(ToString::to_string).collect();
                rows.push(("items", items.join(" ")));
            }
            if let Some(detail) = &corruption.detail {
                rows.push(("detail", detail.clone()));
            }
            if let Some(hint) = &corruption.hint {
                rows.push(("hint", hint.clone()));
            }
            ui.section("Corruption", rows);
        },
    )
}

fn print_concerns(ui: &Ui, concerns: &[Concern], total: u64) {
    ui.list(
        "Concerns",
        concerns
            .iter()
            .map(|c| format!("{:?}: {}", c.kind, c.message)),
    );
    let dropped = total.saturating_sub(concerns.len() as u64);
    if dropped > 0 {
        ui.warn(&format!("{dropped} further concerns not shown"));
    }
}

fn print_btree_text(ui: &Ui, report: &BTreeReport) {
    ui.success(&format!(
        "index \"{}\" passed {} check",
        report.index,
        if report.strict { "strict" } else { "weak" }
    ));
    let root = report
        .root
        .map_or_else(|| "none".to_owned(), |r| r.to_string());
    ui.section(
        "B-Tree",
        [
            ("root", root),
            ("root level", report.root_level.to_string()),
            ("levels", report.levels_checked.to_string()),
            ("pages", report.pages_checked.to_string()),
            ("ignored pages", report.pages_ignored.to_string()),
            ("items", report.items_checked.to_string()),
            ("downlinks", report.downlinks_checked.to_string()),
        ],
    );
    if let Some(heap) = &report.heap {
        ui.section(
            "Table",
            [
                ("table", heap.table.clone()),
                ("rows present", heap.rows_present.to_string()),
                ("rows skipped", heap.rows_skipped.to_string()),
                ("filter bits", heap.bloom_bits.to_string()),
                ("hash functions", heap.bloom_hash_funcs.to_string()),
                ("bits set", format!("{:.4}", heap.proportion_bits_set)),
            ],
        );
    }
    print_concerns(ui, &report.concerns, report.concerns_total);
}

fn print_gist_text(ui: &Ui, report: &GistReport) {
    ui.success(&format!("index \"{}\" passed gist check", report.index));
    ui.section(
        "GiST",
        [
            ("opclass", report.opclass.clone()),
            ("pages", report.pages_checked.to_string()),
            ("tuples", report.tuples_checked.to_string()),
            ("splits followed", report.split_pages_followed.to_string()),
        ],
    );
    print_concerns(ui, &report.concerns, report.concerns_total);
}
