use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::annotate::{draw_results, load_font};
use facewatch_core::gallery::open_backend;
use facewatch_core::{ArcFaceEmbedder, Config, CosineMatcher, GalleryStore, Recognizer, ScrfdDetector};
use facewatch_hw::Camera;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facewatch", about = "Facewatch face gallery administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known identities
    List,
    /// Enroll a face from an image file
    Enroll {
        name: String,
        image: PathBuf,
        /// Flag the identity as wanted
        #[arg(long)]
        wanted: bool,
    },
    /// Recognize faces in an image file
    Recognize {
        image: PathBuf,
        /// Write the annotated image here (format from the extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Set or clear the wanted flag on every entry for a name
    SetWanted {
        name: String,
        #[arg(long)]
        clear: bool,
    },
    /// Remove every known identity
    Clear,
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::List => {
            let names = open_gallery(&config)?.list_names();
            if names.is_empty() {
                println!("No known faces");
            }
            for summary in names {
                let marker = if summary.wanted { "  [WANTED]" } else { "" };
                println!("{}{marker}", summary.name);
            }
        }
        Commands::Enroll { name, image, wanted } => {
            let gallery = open_gallery(&config)?;
            let mut recognizer = load_recognizer(&config, Arc::clone(&gallery))?;
            let frame = read_image(&image)?;
            if !recognizer.enroll(&frame, &name, wanted, config.detection_confidence)? {
                bail!("no face embedding could be extracted from {}", image.display());
            }
            println!("Enrolled '{name}' ({} entries)", gallery.len());
        }
        Commands::Recognize { image, output } => {
            let gallery = open_gallery(&config)?;
            let mut recognizer = load_recognizer(&config, gallery)?;
            let frame = read_image(&image)?;
            let results = recognizer.recognize(&frame, config.detection_confidence)?;

            println!("{} face(s)", results.len());
            for result in &results {
                let b = &result.bbox;
                let identity = &result.identity;
                let wanted = if identity.wanted { " [WANTED]" } else { "" };
                println!(
                    "  {} ({:.2}){wanted} at ({:.0}, {:.0})-({:.0}, {:.0})",
                    identity.name, identity.confidence, b.x1, b.y1, b.x2, b.y2
                );
            }

            if let Some(output) = output {
                let font = config.label_font.as_deref().map(load_font).transpose()?;
                draw_results(&frame, &results, font.as_ref())
                    .save(&output)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                println!("Annotated image written to {}", output.display());
            }
        }
        Commands::SetWanted { name, clear } => {
            let gallery = open_gallery(&config)?;
            if !gallery.set_wanted(&name, !clear)? {
                bail!("no known face named '{name}'");
            }
            println!("{name}: wanted = {}", !clear);
        }
        Commands::Clear => {
            open_gallery(&config)?.clear()?;
            println!("Gallery cleared");
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
            }
        }
    }

    Ok(())
}

fn open_gallery(config: &Config) -> Result<Arc<GalleryStore>> {
    let backend = open_backend(&config.gallery_path)
        .with_context(|| format!("failed to open gallery {}", config.gallery_path.display()))?;
    Ok(Arc::new(GalleryStore::open(backend)))
}

fn load_recognizer(config: &Config, gallery: Arc<GalleryStore>) -> Result<Recognizer> {
    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())?;
    Ok(Recognizer::new(
        Box::new(detector),
        Box::new(embedder),
        CosineMatcher::new(config.match_threshold),
        gallery,
    ))
}

fn read_image(path: &Path) -> Result<image::RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8())
}
