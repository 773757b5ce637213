use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{info, warn};

use card_scanner::config::{default_config_path, ScannerConfig};
use card_scanner::detect::{DetectOptions, HybridDetector};
use card_scanner::features::{compare_images, OrbParams};
use card_scanner::hash::{difference_hash, fingerprint_set, hamming_distance, similarity};
use card_scanner::matching::{
    CorpusEntry, CorpusMatcher, DirectoryReferenceImages, HttpCorpusMatcher, HttpReferenceImages, InMemoryCorpus,
    MatchAggregator, ReferenceImageSource,
};
use card_scanner::models::TextRecognition;
use card_scanner::scan::{CaptureEvent, DirectoryFrameSource, ScanListener, ScanSession, StatusUpdate};

// strip out name/version
const COMMAND_TEMPLATE: &str = "\
    {about-with-newline}\n\
    {usage-heading}\n    {usage}\n\
    \n\
    {all-args}{after-help}\
";

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub fn cli() -> Command {
    let image_arg = |name: &'static str| {
        Arg::new(name)
            .required(true)
            .value_parser(value_parser!(PathBuf))
    };

    Command::new("card-scanner")
        .about("Detect, fingerprint and identify trading cards")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand_value_name("COMMAND")
        .subcommand_help_heading("COMMANDS")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (defaults to the per-user config)"),
        )
        .subcommand(
            Command::new("detect")
                .about("Find the card in one image and rectify it")
                .help_template(COMMAND_TEMPLATE)
                .arg(image_arg("image"))
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the rectified card here"),
                )
                .arg(
                    Arg::new("fast")
                        .long("fast")
                        .action(ArgAction::SetTrue)
                        .help("Quick detection for a manual trigger"),
                ),
        )
        .subcommand(
            Command::new("hash")
                .about("Print the four orientation fingerprints as JSON")
                .help_template(COMMAND_TEMPLATE)
                .arg(image_arg("image")),
        )
        .subcommand(
            Command::new("compare")
                .about("Compare two card images by fingerprint and features")
                .help_template(COMMAND_TEMPLATE)
                .arg(image_arg("a"))
                .arg(image_arg("b")),
        )
        .subcommand(
            Command::new("scan")
                .about("Replay a folder of frames until a card is captured")
                .help_template(COMMAND_TEMPLATE)
                .arg(image_arg("frames"))
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .value_parser(value_parser!(u64))
                        .help("Detection interval in milliseconds"),
                )
                .arg(
                    Arg::new("loop")
                        .long("loop")
                        .action(ArgAction::SetTrue)
                        .help("Restart from the first frame at the end"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory for captured cards"),
                )
                .arg(index_arg())
                .arg(references_arg()),
        )
        .subcommand(
            Command::new("match")
                .about("Identify the card in one image")
                .help_template(COMMAND_TEMPLATE)
                .arg(image_arg("image"))
                .arg(index_arg())
                .arg(references_arg()),
        )
        .subcommand(
            Command::new("index")
                .about("Build a local corpus from a folder of reference images")
                .help_template(COMMAND_TEMPLATE)
                .arg(image_arg("references"))
                .arg(
                    Arg::new("out")
                        .long("out")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Write the effective configuration to the config file")
                .help_template(COMMAND_TEMPLATE),
        )
}

fn index_arg() -> Arg {
    Arg::new("index")
        .long("index")
        .value_parser(value_parser!(PathBuf))
        .help("Local corpus JSON instead of the corpus service")
}

fn references_arg() -> Arg {
    Arg::new("references")
        .long("references")
        .value_parser(value_parser!(PathBuf))
        .help("Folder holding the reference images of a local corpus")
}

pub async fn respond(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<PathBuf>("config").cloned();
    let config = ScannerConfig::load(config_path.as_deref()).context("unable to load configuration")?;

    match matches.subcommand() {
        Some(("detect", sub)) => detect(&config, sub),
        Some(("hash", sub)) => hash(sub),
        Some(("compare", sub)) => compare(sub),
        Some(("scan", sub)) => scan(config, sub).await,
        Some(("match", sub)) => identify(&config, sub).await,
        Some(("index", sub)) => index(sub),
        Some(("config", _)) => {
            let path = match config_path {
                Some(path) => path,
                None => default_config_path()?,
            };
            config.save(&path)?;
            println!("{}", path.display());
            Ok(())
        }
        _ => bail!("subcommand required"),
    }
}

fn path_arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a PathBuf> {
    matches
        .get_one::<PathBuf>(name)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))
}

fn open_image(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("unable to open {}", path.display()))?
        .to_rgb8())
}

fn detect(config: &ScannerConfig, matches: &ArgMatches) -> Result<()> {
    let frame = open_image(path_arg(matches, "image")?)?;
    let detector = HybridDetector::new(&config.detect)?;
    let options = DetectOptions::from(&config.detect);

    let result = if matches.get_flag("fast") {
        detector.quick_detect(&frame, &options)
    } else {
        detector.detect(&frame, &options).result
    };
    println!(
        "{}",
        serde_json::json!({
            "success": result.success,
            "confidence": result.confidence,
            "area": result.area,
            "method": result.method,
            "corners": result.corners,
        })
    );

    if let Some(out) = matches.get_one::<PathBuf>("out") {
        if !result.success {
            bail!("no card detected, nothing written");
        }
        result.rectified.save(out)?;
        info!("Rectified card written to {}", out.display());
    }
    Ok(())
}

fn hash(matches: &ArgMatches) -> Result<()> {
    let image = open_image(path_arg(matches, "image")?)?;
    let set = fingerprint_set(&image)?;
    println!("{}", serde_json::to_string_pretty(&set)?);
    Ok(())
}

fn compare(matches: &ArgMatches) -> Result<()> {
    let a = open_image(path_arg(matches, "a")?)?;
    let b = open_image(path_arg(matches, "b")?)?;
    let (fa, _) = difference_hash(&a)?;
    let (fb, _) = difference_hash(&b)?;
    let features = compare_images(&a, &b, &OrbParams::default());

    println!(
        "{}",
        serde_json::json!({
            "hamming_distance": hamming_distance(&fa, &fb),
            "similarity": similarity(&fa, &fb),
            "feature_matches": features.matches.len(),
            "good_matches": features.good_matches,
            "feature_score": features.match_score,
        })
    );
    Ok(())
}

/// Forwards captures to the command and prints every status line.
struct Forwarder {
    captures: mpsc::UnboundedSender<CaptureEvent>,
}

impl ScanListener for Forwarder {
    fn on_status(&self, status: &StatusUpdate) {
        println!(
            "{:<9} confidence {:.2} avg {:.2} method {}",
            status.state, status.confidence, status.avg_confidence, status.method
        );
    }

    fn on_capture(&self, capture: CaptureEvent) {
        let _ = self.captures.send(capture);
    }
}

async fn scan(mut config: ScannerConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(interval) = matches.get_one::<u64>("interval") {
        config.scan.detection_interval_ms = *interval;
    }
    let source = DirectoryFrameSource::open(path_arg(matches, "frames")?)?.looping(matches.get_flag("loop"));
    let session = ScanSession::new(&config)?;
    info!("Scanning {} frames in session {}", source.len(), session.id());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = session.start(source, Arc::new(Forwarder { captures: tx }));

    let capture = tokio::select! {
        capture = rx.recv() => capture,
        _ = tokio::signal::ctrl_c() => None,
    };
    let summary = handle.stop().await;
    info!(
        "{} ticks, {} cycles, {} skipped, {} captures",
        summary.ticks, summary.cycles, summary.skipped, summary.captures
    );

    let Some(capture) = capture else {
        println!("No card captured");
        return Ok(());
    };
    println!("Captured card, confidence {:.2}", capture.confidence);
    if let Some(dir) = matches.get_one::<PathBuf>("out") {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("capture-{}.png", chrono::Local::now().format("%Y%m%d-%H%M%S")));
        capture.image.save(&path)?;
        println!("Saved {}", path.display());
    }

    match aggregator(&config, matches) {
        Ok(aggregator) => {
            let text = recognize_text(&config, &capture.image);
            let outcome = aggregator.identify(&capture.image, text.as_ref()).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Err(err) => warn!("Skipping identification: {}", err),
    }
    Ok(())
}

async fn identify(config: &ScannerConfig, matches: &ArgMatches) -> Result<()> {
    let frame = open_image(path_arg(matches, "image")?)?;
    let detector = HybridDetector::new(&config.detect)?;
    let detection = detector.quick_detect(&frame, &DetectOptions::from(&config.detect));
    let card = if detection.success {
        detection.rectified
    } else {
        warn!("No card boundary found, identifying the whole image");
        frame
    };

    let aggregator = aggregator(config, matches)?;
    let text = recognize_text(config, &card);
    let outcome = aggregator.identify(&card, text.as_ref()).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn aggregator(config: &ScannerConfig, matches: &ArgMatches) -> Result<MatchAggregator> {
    let timeout = config.matching.request_timeout();
    let corpus: Arc<dyn CorpusMatcher> = match (matches.get_one::<PathBuf>("index"), &config.matching.corpus_url) {
        (Some(index), _) => Arc::new(InMemoryCorpus::load(index)?),
        (None, Some(url)) => Arc::new(HttpCorpusMatcher::new(url, timeout)?),
        (None, None) => bail!("no corpus: pass --index or set matching.corpus_url"),
    };
    let references: Arc<dyn ReferenceImageSource> = match matches.get_one::<PathBuf>("references") {
        Some(dir) => Arc::new(DirectoryReferenceImages::new(dir)),
        None => Arc::new(HttpReferenceImages::new(timeout)?),
    };
    Ok(MatchAggregator::new(corpus, config.matching.clone()).with_references(references))
}

#[cfg(feature = "ocr")]
fn recognize_text(config: &ScannerConfig, image: &RgbImage) -> Option<TextRecognition> {
    use card_scanner::matching::{TesseractRecognizer, TextRecognizer};

    let recognizer = TesseractRecognizer::new(config.matching.tessdata_path.clone());
    match recognizer.recognize(image) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!("Text recognition failed: {}", err);
            None
        }
    }
}

#[cfg(not(feature = "ocr"))]
fn recognize_text(_config: &ScannerConfig, _image: &RgbImage) -> Option<TextRecognition> {
    None
}

fn index(matches: &ArgMatches) -> Result<()> {
    let dir = path_arg(matches, "references")?;
    let out = path_arg(matches, "out")?;

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut corpus = InMemoryCorpus::default();
    for path in paths {
        let (Some(stem), Some(file_name)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.file_name().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        let image = match image::open(&path) {
            Ok(image) => image.to_rgb8(),
            Err(err) => {
                warn!("Skipping {}: {}", path.display(), err);
                continue;
            }
        };
        let mut entry = CorpusEntry::from_image(stem, &image)?;
        entry.name = Some(stem.replace(['_', '-'], " "));
        entry.image_reference = Some(file_name.to_string());
        corpus.push(entry);
    }

    fs::write(out, serde_json::to_string_pretty(corpus.entries())?)?;
    println!("Indexed {} references into {}", corpus.entries().len(), out.display());
    Ok(())
}
