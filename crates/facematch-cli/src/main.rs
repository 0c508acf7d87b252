use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{ClusterMatcher, Embedding, Matcher, MatcherConfig, Metric, ModelInfo};
use facematch_gallery::{
    EmbeddingGallery, EnrollOutcome, EnrollmentWorkflow, FileStore, GalleryStore, PersistPolicy,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facematch", about = "facematch gallery tool")]
struct Cli {
    /// Gallery file
    #[arg(long, env = "FACEMATCH_GALLERY_PATH", default_value = "gallery.json")]
    gallery: PathBuf,

    /// Read-only gallery used when the gallery file does not exist yet
    #[arg(long, env = "FACEMATCH_BUNDLED_GALLERY")]
    bundled: Option<PathBuf>,

    /// Embedding model preset (facenet, facenet-quantized)
    #[arg(long, env = "FACEMATCH_MODEL", default_value = "facenet")]
    model: String,

    /// Override the model's embedding dimension
    #[arg(long, env = "FACEMATCH_EMBEDDING_DIM")]
    dim: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities and sample counts
    List,
    /// Enroll an embedding under a name and save the gallery
    Enroll {
        /// Identity name
        #[arg(short, long)]
        name: String,
        /// JSON file holding the embedding
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Identify an embedding against the gallery
    Match {
        /// JSON file holding the query embedding
        #[arg(short, long)]
        embedding: PathBuf,
        /// l2 or cosine
        #[arg(long, default_value = "l2")]
        metric: String,
        /// Acceptance threshold for the chosen metric (model default if omitted)
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Write the human-readable text dump next to the gallery file
    Export,
    /// Show gallery and model information
    Status,
}

/// An embedding file: either a bare array or `{"values": [...], "model_version": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f32>),
    Full(Embedding),
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read embedding {}", path.display()))?;
    let file: EmbeddingFile = serde_json::from_str(&text)
        .with_context(|| format!("{} is not an embedding", path.display()))?;
    Ok(match file {
        EmbeddingFile::Bare(values) => Embedding::new(values),
        EmbeddingFile::Full(embedding) => embedding,
    })
}

impl Cli {
    fn store(&self) -> FileStore {
        let store = FileStore::new(&self.gallery);
        match &self.bundled {
            Some(bundled) => store.with_bundled(bundled),
            None => store,
        }
    }

    fn matcher_config(&self, metric: Metric) -> Result<MatcherConfig> {
        let model = ModelInfo::by_key(&self.model)?;
        let mut config = MatcherConfig::for_model(model, metric);
        if let Some(dim) = self.dim {
            config.embedding_dim = dim;
        }
        config.validate()?;
        Ok(config)
    }
}

fn run(cli: &Cli) -> Result<String> {
    let store = cli.store();
    let mut gallery = EmbeddingGallery::load(Arc::new(store.clone()))
        .with_context(|| format!("failed to load gallery {}", store.describe()))?;

    let output = match &cli.command {
        Commands::List => {
            let identities = gallery.gallery().identities();
            if identities.is_empty() {
                "No faces enrolled".to_string()
            } else {
                identities
                    .iter()
                    .map(|(name, samples)| format!("{name}\t{samples}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Commands::Enroll { name, embedding } => {
            let embedding = read_embedding(embedding)?;
            let config = cli.matcher_config(Metric::default())?;
            let workflow = EnrollmentWorkflow::new(PersistPolicy::AfterEnroll, config.embedding_dim);
            match workflow.enroll(&mut gallery, name, embedding)? {
                EnrollOutcome::RejectedBlankName => bail!("name must not be blank"),
                EnrollOutcome::Enrolled {
                    identity, samples, ..
                } => {
                    gallery.save()?;
                    format!("Enrolled {identity} ({samples} sample(s))")
                }
            }
        }
        Commands::Match {
            embedding,
            metric,
            threshold,
        } => {
            let query = read_embedding(embedding)?;
            let metric: Metric = metric.parse()?;
            let mut config = cli.matcher_config(metric)?;
            if let Some(t) = threshold {
                match metric {
                    Metric::L2 => config.l2_threshold = *t,
                    Metric::Cosine => config.cosine_threshold = *t,
                }
            }
            let verdict = ClusterMatcher::new(config)?.identify(&query, gallery.gallery())?;
            serde_json::to_string_pretty(&verdict)?
        }
        Commands::Export => {
            let path = store.export_text_dump(gallery.gallery())?;
            format!("Wrote {}", path.display())
        }
        Commands::Status => {
            let model = ModelInfo::by_key(&cli.model)?;
            serde_json::to_string_pretty(&json!({
                "version": env!("CARGO_PKG_VERSION"),
                "gallery": store.describe(),
                "source": format!("{:?}", gallery.source()),
                "entries": gallery.len(),
                "identities": gallery.gallery().identities().len(),
                "model": model.name,
                "embedding_dim": cli.dim.unwrap_or(model.embedding_dim),
                "cosine_threshold": model.cosine_threshold,
                "l2_threshold": model.l2_threshold,
            }))?
        }
    };

    Ok(output)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    println!("{}", run(&cli)?);
    Ok(())
}
