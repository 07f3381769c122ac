mod args;

use std::fs::File;
use std::path::Path;

use clap::Parser;
use log::LevelFilter;

use terrasource::envelope::Envelope;
use terrasource::error::{Error, Result};
use terrasource::geojson::extract::extract_feature_boxes;
use terrasource::geojson::validate_feature_slice;
use terrasource::index::file::sidecar_path;
use terrasource::index::{IndexRecord, QuadTree};
use terrasource::source::ByteSource;

use crate::args::Args;

fn is_csv(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("csv") | Some("tsv")
    )
}

fn is_geojson(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("geojson") | Some("json")
    )
}

fn char_arg(value: Option<char>, name: &'static str) -> Result<Option<u8>> {
    match value {
        None => Ok(None),
        Some(c) if c.is_ascii() => Ok(Some(c as u8)),
        Some(_) => Err(Error::InvalidParam {
            key: name.into(),
            reason: "expected a single ascii character".into(),
        }),
    }
}

/// Box-scan one input, returning the records to insert and the data extent.
fn collect_boxes(path: &Path, args: &Args) -> Result<(Vec<IndexRecord>, Envelope<f64>)> {
    if is_csv(path) {
        log::info!("processing '{}' as CSV", path.display());
        return terrasource::csv::scan_for_index(
            path,
            char_arg(args.separator, "separator")?,
            char_arg(args.quote, "quote")?,
            args.manual_headers.as_deref(),
        );
    }
    log::info!("processing '{}' as GeoJSON", path.display());
    let source = ByteSource::open(path)?;
    let data = source.read_all()?;
    let extracted = extract_feature_boxes(&data)?;
    let mut extent = Envelope::invalid();
    let mut records = Vec::with_capacity(extracted.boxes.len());
    for feature_box in &extracted.boxes {
        if args.validate_features {
            let slice = &data
                [feature_box.offset as usize..(feature_box.offset + feature_box.size) as usize];
            validate_feature_slice(slice, feature_box.offset, extracted.kind)?;
        }
        if !feature_box.envelope.valid() {
            log::warn!(
                "feature at byte {} has no usable geometry, skipping",
                feature_box.offset
            );
            continue;
        }
        extent.expand_to_include(&feature_box.envelope);
        records.push(IndexRecord {
            offset: feature_box.offset,
            size: feature_box.size,
            envelope: feature_box.envelope.to_f32(),
        });
    }
    Ok((records, extent))
}

fn process_file(path: &Path, args: &Args, clip: Option<Envelope<f64>>) -> Result<()> {
    let (records, extent) = collect_boxes(path, args)?;
    if !extent.valid() {
        return Err(Error::MalformedFile(format!(
            "'{}' yields no indexable records (invalid extent)",
            path.display()
        )));
    }

    let tree_extent = clip.unwrap_or(extent);
    let mut tree = QuadTree::with_params(tree_extent.to_f32(), args.depth, args.ratio);
    for record in records {
        if let Some(clip) = &clip {
            if !clip.intersects(&record.envelope.to_f64()) {
                continue;
            }
        }
        tree.insert(record);
    }
    tree.trim();
    log::info!("extent: {extent}");
    log::info!("number nodes: {}", tree.count());
    log::info!("number elements: {}", tree.count_items());

    let index_path = sidecar_path(path);
    let mut file = File::create(&index_path)?;
    tree.write(&mut file)?;
    log::info!("wrote '{}'", index_path.display());
    Ok(())
}

fn main() {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init()
        .expect("logger init");

    let clip = match &args.bbox {
        Some(text) => match text.parse::<Envelope<f64>>() {
            Ok(env) => Some(env),
            Err(err) => {
                log::error!("invalid --bbox: {err}");
                std::process::exit(1);
            }
        },
        None => None,
    };
    if args.ratio <= 0.5 || args.ratio >= 1.0 {
        log::error!("--ratio must lie in (0.5, 1.0)");
        std::process::exit(1);
    }

    // Routing is by extension alone; a named file that turns out to be
    // missing fails its processing step rather than being filtered away.
    let files: Vec<_> = args
        .files
        .iter()
        .filter(|path| is_csv(path) || is_geojson(path))
        .cloned()
        .collect();
    if files.is_empty() {
        log::error!("no files to index");
        std::process::exit(1);
    }

    log::info!("max tree depth: {}", args.depth);
    log::info!("split ratio: {}", args.ratio);

    let mut failed = false;
    for path in &files {
        if let Err(err) = process_file(path, &args, clip) {
            log::error!("failed to process '{}': {err}", path.display());
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
    log::info!("done!");
}
