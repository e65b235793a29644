use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradepost_api::SignUp;
use tradepost_cache::{DurableStore, MemoryStore, QueryCache, SqliteStore, SystemClock};
use tradepost_core::models::{Category, Product, Review};
use tradepost_core::repository::without_nulls;
use tradepost_core::{Config, SessionStore, Storefront};

#[derive(Parser)]
#[command(name = "tradepost")]
#[command(version, about = "Wholesale marketplace client", long_about = None)]
struct Cli {
    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Don't read or write the on-disk cache snapshot
    #[arg(long, global = true)]
    no_persist: bool,

    /// Override how long results stay fresh (seconds)
    #[arg(long, global = true, env = "TRADEPOST_STALE_SECS")]
    stale_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List products, optionally filtered
    Products {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        supplier: Option<String>,
    },
    /// Show one product
    Product { id: String },
    /// Search product names and descriptions
    Search { term: String },
    /// Add a product listing
    AddProduct {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        supplier: Option<String>,
    },
    /// List categories
    Categories,
    /// Reviews for a product
    Reviews { product_id: String },
    /// Review a product
    Review {
        product_id: String,
        #[arg(long)]
        rating: i32,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Create an account
    Signup {
        email: String,
        #[arg(long, env = "TRADEPOST_PASSWORD")]
        password: String,
        #[arg(long)]
        company: Option<String>,
    },
    /// Sign in and remember the session
    Signin {
        email: String,
        #[arg(long, env = "TRADEPOST_PASSWORD")]
        password: String,
    },
    /// Forget the current session
    Signout,
    /// Show the signed-in account
    Whoami,
    /// Inspect or clear the local query cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(clap::Subcommand)]
enum CacheAction {
    /// Show cached queries
    Stats,
    /// Drop everything cached
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging - helps when things go sideways
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradepost=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Missing backend settings stop us before anything else happens
    let mut config = Config::load().context("tradepost is not configured")?;
    if cli.no_persist {
        config.cache.persist = false;
    }
    if let Some(secs) = cli.stale_secs {
        config.cache.stale_time_secs = secs;
    }

    let sessions = SessionStore::default_location()?;
    let session = sessions.load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable session at {}: {}", sessions.path().display(), e);
        None
    });

    let cache = open_cache(&config)?;
    let storefront = Storefront::connect(&config.backend, session, cache.clone())?;

    let outcome = run(&cli, &storefront, &sessions).await;
    // Background refreshes started by stale reads land in the snapshot
    cache.wait_idle().await;
    cache.teardown();
    outcome
}

fn open_cache(config: &Config) -> anyhow::Result<QueryCache> {
    let store: Arc<dyn DurableStore> = if config.cache.persist {
        let path = config.cache.db_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!("Cache snapshot at {}", path.display());
        Arc::new(SqliteStore::open(&path)?)
    } else {
        Arc::new(MemoryStore::new())
    };

    Ok(QueryCache::init(
        config.cache.to_cache_config(),
        store,
        Arc::new(SystemClock),
    ))
}

async fn run(cli: &Cli, store: &Storefront, sessions: &SessionStore) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Products { category, supplier } => {
            let products = match (category, supplier) {
                (Some(category), _) => store.products_in_category(category).await?,
                (None, Some(supplier)) => store.products_by_supplier(supplier).await?,
                (None, None) => store.products().await?,
            };
            print_products(&products, cli.json)?;
        }
        Commands::Product { id } => {
            let product = store.product(id).await?;
            print_json(&product)?;
        }
        Commands::Search { term } => {
            tracing::info!("Searching for: {}", term);
            let products = store.search_products(term).await?;
            print_products(&products, cli.json)?;
        }
        Commands::AddProduct {
            name,
            description,
            price,
            category,
            supplier,
        } => {
            let row = without_nulls(json!({
                "name": name,
                "description": description,
                "price": price,
                "category_id": category,
                "supplier_id": supplier,
            }));
            let product = store.create_product(&row).await?;
            println!("Created product {}", product.id);
        }
        Commands::Categories => {
            let categories = store.categories().await?;
            print_categories(&categories, cli.json)?;
        }
        Commands::Reviews { product_id } => {
            let reviews = store.reviews_for(product_id).await?;
            print_reviews(&reviews, cli.json)?;
        }
        Commands::Review {
            product_id,
            rating,
            comment,
        } => {
            if !(1..=5).contains(rating) {
                anyhow::bail!("Rating must be between 1 and 5");
            }
            let user = store.current_user().await?.context("Sign in to leave a review")?;
            let row = without_nulls(json!({
                "product_id": product_id,
                "user_id": user.id,
                "rating": rating,
                "comment": comment,
            }));
            let review = store.create_review(&row).await?;
            println!("Posted review {}", review.id);
        }
        Commands::Signup {
            email,
            password,
            company,
        } => {
            let metadata = without_nulls(json!({ "company_name": company }));
            match store.sign_up(email, password, metadata).await? {
                SignUp::SignedIn(session) => {
                    sessions.save(&session)?;
                    println!("Welcome aboard, {}", email);
                }
                SignUp::PendingConfirmation(_) => {
                    println!("Check {} for a confirmation link", email);
                }
            }
        }
        Commands::Signin { email, password } => {
            let session = store.sign_in(email, password).await?;
            sessions.save(&session)?;
            println!("Signed in as {}", email);
        }
        Commands::Signout => {
            store.sign_out().await?;
            sessions.clear()?;
            println!("Signed out");
        }
        Commands::Whoami => match store.current_user().await? {
            Some(user) => println!("{} ({})", user.email.unwrap_or_default(), user.id),
            None => println!("Not signed in"),
        },
        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                let cache = store.cache();
                println!("{} cached queries", cache.len());
                for key in cache.keys() {
                    println!("  {:<50} {:?}", key.to_string(), cache.state(&key));
                }
            }
            CacheAction::Clear => {
                store.cache().clear()?;
                println!("Cache cleared");
            }
        },
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_products(products: &[Product], as_json: bool) -> anyhow::Result<()> {
    if as_json {
        return print_json(products);
    }
    if products.is_empty() {
        println!("No products found");
        return Ok(());
    }

    println!("{:<38} {:<40} {:>10}", "ID", "NAME", "PRICE");
    for product in products {
        let price = product
            .price
            .map(|p| format!("{:.2} {}", p, product.currency.as_deref().unwrap_or("")))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:<40} {:>10}", product.id, truncate(&product.name, 40), price.trim());
    }
    Ok(())
}

fn print_categories(categories: &[Category], as_json: bool) -> anyhow::Result<()> {
    if as_json {
        return print_json(categories);
    }
    for category in categories {
        println!("{:<38} {}", category.id, category.name);
    }
    Ok(())
}

fn print_reviews(reviews: &[Review], as_json: bool) -> anyhow::Result<()> {
    if as_json {
        return print_json(reviews);
    }
    if reviews.is_empty() {
        println!("No reviews yet");
        return Ok(());
    }
    for review in reviews {
        let stars = review.rating.map(|r| "*".repeat(r.clamp(0, 5) as usize)).unwrap_or_default();
        println!("{:<5} {}", stars, review.comment.as_deref().unwrap_or(""));
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long product name", 10), "a very ...");
    }
}
