use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use ticket_checkout::{
    config,
    db,
    entities::promo_code::{DiscountType, Model as PromoCodeModel},
    services::promotions::{NewPromoCode, PromotionService},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);
    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        db::run_migrations(&pool)
            .await
            .context("failed running migrations")?;
    }
    let service = PromotionService::new(Arc::new(pool));

    match cli.command {
        Commands::Create(args) => {
            let created = service
                .create_promo_code(args.into_input())
                .await
                .context("failed to create promo code")?;
            render(&created, cli.json)?;
        }
        Commands::Deactivate(args) => {
            let updated = service
                .deactivate_promo_code(&args.code)
                .await
                .context("failed to deactivate promo code")?;
            render(&updated, cli.json)?;
        }
        Commands::List => {
            let codes = service
                .list_promo_codes()
                .await
                .context("failed to list promo codes")?;
            if cli.json {
                print_json(&codes)?;
            } else if codes.is_empty() {
                println!("No promo codes");
            } else {
                for code in &codes {
                    print_line(code);
                }
            }
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "promo-admin", about = "Manage checkout promo codes", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new promo code
    Create(CreateArgs),
    /// Stop a code from validating
    Deactivate(DeactivateArgs),
    /// List every code with its usage
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum DiscountKind {
    Percentage,
    Fixed,
}

impl From<DiscountKind> for DiscountType {
    fn from(kind: DiscountKind) -> Self {
        match kind {
            DiscountKind::Percentage => DiscountType::Percentage,
            DiscountKind::Fixed => DiscountType::Fixed,
        }
    }
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long, help = "Code buyers will type; stored upper-cased")]
    code: String,
    #[arg(long, value_enum, default_value = "percentage")]
    kind: DiscountKind,
    #[arg(long, help = "Percent off, or a fixed amount in the canonical currency")]
    value: Decimal,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, help = "Minimum order subtotal", default_value = "0")]
    minimum_amount: Decimal,
    #[arg(long, help = "Cap on the discount amount")]
    maximum_discount: Option<Decimal>,
    #[arg(long, help = "Total number of redemptions allowed")]
    usage_limit: Option<i32>,
    #[arg(long, help = "RFC 3339 start of validity; defaults to now")]
    valid_from: Option<DateTime<Utc>>,
    #[arg(long, help = "RFC 3339 end of validity")]
    valid_until: Option<DateTime<Utc>>,
    #[arg(long = "ticket-type", help = "Restrict to a ticket type; repeatable")]
    ticket_types: Vec<String>,
    #[arg(long, help = "Restrict to an event id")]
    event_id: Option<String>,
}

impl CreateArgs {
    fn into_input(self) -> NewPromoCode {
        NewPromoCode {
            code: self.code,
            description: self.description,
            discount_type: self.kind.into(),
            discount_value: self.value,
            minimum_amount: self.minimum_amount,
            maximum_discount: self.maximum_discount,
            usage_limit: self.usage_limit,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            applicable_ticket_types: self.ticket_types,
            applicable_event_id: self.event_id,
        }
    }
}

#[derive(Args)]
struct DeactivateArgs {
    #[arg(long)]
    code: String,
}

fn render(code: &PromoCodeModel, json: bool) -> Result<()> {
    if json {
        print_json(code)
    } else {
        print_line(code);
        Ok(())
    }
}

fn print_line(code: &PromoCodeModel) {
    let usage = match code.usage_limit {
        Some(limit) => format!("{}/{}", code.used_count, limit),
        None => format!("{}/unlimited", code.used_count),
    };
    let value = match code.discount_type {
        DiscountType::Percentage => format!("{}%", code.discount_value),
        DiscountType::Fixed => format!("{} off", code.discount_value),
    };
    println!(
        "{:<16} {:<12} used {:<14} {}",
        code.code,
        value,
        usage,
        if code.is_active { "active" } else { "inactive" }
    );
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
