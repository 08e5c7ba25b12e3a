use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use radar_core::{Page, ProductFilter, ProductRecord};
use radar_storage::SqliteProductStore;
use radar_sync::{RadarConfig, RadarPipeline};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "radar")]
#[command(about = "Price Radar product and competitor acquisition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Marketplace {
    /// Marketplace domain suffix (com, ca, co.uk, de, fr, it, ae, in)
    #[arg(long)]
    domain: Option<String>,
    /// Zip/postal code used for localized pricing
    #[arg(long)]
    geo: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a product by ASIN and store it
    Acquire {
        id: String,
        #[command(flatten)]
        marketplace: Marketplace,
    },
    /// Show competitors of a stored product, discovering them if needed
    Competitors {
        id: String,
        #[arg(long)]
        refresh: bool,
        #[command(flatten)]
        marketplace: Marketplace,
    },
    /// List stored products
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        per_page: Option<usize>,
        #[arg(long)]
        roots: bool,
    },
    /// Print one stored product as JSON
    Show { id: String },
    /// Print the analysis payload for a product
    Payload {
        id: String,
        /// Render the summarizer prompt instead of JSON
        #[arg(long)]
        prompt: bool,
    },
    /// Run the summarizer over a product and its competitors
    Analyze { id: String },
    Serve,
    Migrate,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn print_record(record: &ProductRecord) {
    let price = record.display_price().unwrap_or_else(|| "-".to_string());
    let brand = record.brand.as_deref().unwrap_or("-");
    let geo = record.locale_hint.as_deref().unwrap_or("-");
    println!(
        "{:<12} {:<12} {:<14} amazon.{:<6} geo={:<8} {}",
        record.id,
        price,
        brand,
        record.marketplace_domain,
        geo,
        record.display_title()
    );
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn pipeline(config: &RadarConfig) -> Result<RadarPipeline> {
    radar_sync::build_pipeline(config)
        .await
        .context("building acquisition pipeline")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RadarConfig::load().context("loading configuration")?;
    init_tracing(&config.log_filter)?;

    let domain_or_default =
        |m: &Marketplace| m.domain.clone().unwrap_or_else(|| config.default_domain.clone());

    match cli.command {
        Commands::Acquire { id, marketplace } => {
            let domain = domain_or_default(&marketplace);
            let record = pipeline(&config)
                .await?
                .acquire_product(&id, marketplace.geo.as_deref(), &domain)
                .await
                .with_context(|| format!("acquiring {id}"))?;
            print_record(&record);
        }
        Commands::Competitors {
            id,
            refresh,
            marketplace,
        } => {
            let domain = domain_or_default(&marketplace);
            let competitors = pipeline(&config)
                .await?
                .resolve_competitors(&id, &domain, marketplace.geo.as_deref(), refresh)
                .await
                .with_context(|| format!("resolving competitors of {id}"))?;
            println!("{} competitors for {id}", competitors.len());
            competitors.iter().for_each(print_record);
        }
        Commands::List {
            page,
            per_page,
            roots,
        } => {
            let pipeline = pipeline(&config).await?;
            let store = pipeline.store();
            let all = if roots {
                store.search(&ProductFilter::roots()).await?
            } else {
                store.list_all().await?
            };
            let page = Page::paginate(all, Some(page), per_page);
            match page.showing() {
                Some((first, last)) => {
                    println!("Showing {first} - {last} of {} products", page.total)
                }
                None => println!("No products stored yet"),
            }
            page.items.iter().for_each(print_record);
        }
        Commands::Show { id } => {
            let pipeline = pipeline(&config).await?;
            let record = pipeline
                .store()
                .get(&id)
                .await?
                .with_context(|| format!("product {id} not found"))?;
            print_json(&record)?;
        }
        Commands::Payload { id, prompt } => {
            let payload = pipeline(&config).await?.build_analysis_payload(&id).await?;
            if prompt {
                println!("{}", payload.render_prompt(config.prompt_max_competitors));
            } else {
                print_json(&payload)?;
            }
        }
        Commands::Analyze { id } => {
            let analysis = pipeline(&config)
                .await?
                .analyze_competitors(&id)
                .await
                .with_context(|| format!("analyzing competitors of {id}"))?;
            println!("{analysis}");
        }
        Commands::Serve => {
            radar_web::serve(&config).await?;
        }
        Commands::Migrate => {
            SqliteProductStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("schema ready at {}", config.database_url);
        }
    }

    Ok(())
}
