use clap::Parser;

/// Command line utility that builds the sidecar spatial index for CSV and
/// GeoJSON files. Each input gets a `<input>.index` file next to it holding
/// a serialized quadtree of record offsets and envelopes; datasources that
/// find the sidecar skip their own bulk scan on open.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Files to index: file1 file2 ... fileN. Inputs that are neither
    /// {n}.csv/.tsv nor .geojson/.json are skipped.
    pub files: Vec<std::path::PathBuf>,

    /// Maximum quadtree depth.
    #[arg(short, long, default_value_t = 8)]
    pub depth: u32,

    /// Quadtree split ratio: each child covers this share of its parent
    /// {n}per axis, so values above 0.5 overlap at the center.
    #[arg(short, long, default_value_t = 0.55)]
    pub ratio: f64,

    /// CSV column separator, overriding dialect detection.
    #[arg(short, long)]
    pub separator: Option<char>,

    /// CSV quote character, overriding dialect detection.
    #[arg(short, long)]
    pub quote: Option<char>,

    /// Manual CSV header row; the file is then read as having none.
    #[arg(short = 'H', long)]
    pub manual_headers: Option<String>,

    /// Only index records intersecting this box: --bbox=minx,miny,maxx,maxy.
    #[arg(short, long)]
    pub bbox: Option<String>,

    /// Fully parse each GeoJSON feature instead of trusting the streaming
    /// {n}extractor.
    #[arg(long)]
    pub validate_features: bool,

    /// Verbose output.
    #[arg(short, long)]
    pub verbose: bool,
}
