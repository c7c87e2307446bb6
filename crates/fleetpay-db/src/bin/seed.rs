//! # Seed Data Generator
//!
//! Populates the database with demo tenants and bookings for development.
//!
//! ## Usage
//! ```bash
//! # 3 tenants, 20 bookings each (default)
//! cargo run -p fleetpay-db --bin seed
//!
//! # More bookings per tenant
//! cargo run -p fleetpay-db --bin seed -- --count 200
//!
//! # Specify database path
//! cargo run -p fleetpay-db --bin seed -- --db ./data/fleetpay.db
//! ```
//!
//! ## Generated Data
//! - One active processor sub-account per tenant (fee 8% - 12.5%)
//! - Pending bookings of $45 - $845 for a handful of customers
//!
//! Bookings start with no settlement activity; drive them through the
//! settlement API or processor webhooks.

use chrono::Utc;
use std::env;

use fleetpay_core::money::format_minor;
use fleetpay_core::{Booking, TenantAccount};
use fleetpay_db::{Database, DbConfig};

/// Demo rental companies with their platform fee in basis points.
const TENANTS: &[(&str, &str, u32)] = &[
    ("tenant-coastal", "acct_demo_coastal", 1000),
    ("tenant-metro", "acct_demo_metro", 800),
    ("tenant-alpine", "acct_demo_alpine", 1250),
];

const CUSTOMERS: &[&str] = &["cust-ada", "cust-grace", "cust-linus", "cust-barbara", "cust-ken"];

struct SeedArgs {
    count: usize,
    db_path: String,
    currency: String,
}

const USAGE: &str = "\
FleetPay Seed Data Generator

Usage: seed [OPTIONS]

Options:
  -c, --count <N>          Bookings per tenant (default: 20)
  -d, --db <PATH>          Database file path (default: ./fleetpay_dev.db)
      --currency <CODE>    Booking currency (default: USD)
  -h, --help               Show this help message";

/// Returns `None` when help was requested.
fn parse_args(mut args: impl Iterator<Item = String>) -> Option<SeedArgs> {
    let mut parsed = SeedArgs {
        count: 20,
        db_path: "./fleetpay_dev.db".to_string(),
        currency: "USD".to_string(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--count" | "-c" => {
                if let Some(n) = args.next().and_then(|v| v.parse().ok()) {
                    parsed.count = n;
                }
            }
            "--db" | "-d" => {
                if let Some(path) = args.next() {
                    parsed.db_path = path;
                }
            }
            "--currency" => {
                if let Some(code) = args.next() {
                    parsed.currency = code.to_ascii_uppercase();
                }
            }
            "--help" | "-h" => return None,
            other => eprintln!("Ignoring unknown argument {other}"),
        }
    }
    Some(parsed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(SeedArgs { count, db_path, currency }) = parse_args(env::args().skip(1)) else {
        println!("{USAGE}");
        return Ok(());
    };

    println!("🌱 FleetPay Seed Data Generator");
    println!("==============================");
    println!("Database: {}", db_path);
    println!("Bookings per tenant: {} ({})", count, currency);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;

    println!("✓ Connected to database");
    println!("✓ Migrations applied");
    println!();

    let started = std::time::Instant::now();
    let mut generated = 0;
    let mut volume_minor = 0i64;

    for (tenant_idx, (tenant_id, account_id, fee_bps)) in TENANTS.iter().enumerate() {
        let existing = db.bookings().count_for_tenant(tenant_id).await?;
        if existing > 0 {
            println!("⚠ {} already has {} bookings, skipping", tenant_id, existing);
            continue;
        }

        let now = Utc::now();
        let mut account = TenantAccount::new(*tenant_id, *fee_bps, now);
        account.processor_account_id = Some(account_id.to_string());
        account.charges_enabled = true;
        account.payouts_enabled = true;
        account.onboarding_complete = true;
        account.last_synced_at = Some(now);
        db.tenants().save(&account).await?;

        println!("✓ Tenant {} ({}, fee {} bps)", tenant_id, account_id, fee_bps);

        for n in 0..count {
            let seed = tenant_idx * 1000 + n;
            let booking = generate_booking(tenant_id, &currency, seed);

            if let Err(e) = db.bookings().insert(&booking).await {
                eprintln!("Failed to insert booking {}: {}", booking.id, e);
                continue;
            }
            generated += 1;
            volume_minor += booking.total_minor;
        }
    }

    println!();
    println!("✓ Generated {} bookings in {:?}", generated, started.elapsed());
    println!("  Rental volume: {}", format_minor(volume_minor, &currency));

    Ok(())
}

/// Generates a pending booking with a deterministic price.
fn generate_booking(tenant_id: &str, currency: &str, seed: usize) -> Booking {
    // 45.00 - 845.00 in 5.00 steps
    let total_minor = 4500 + ((seed * 37) % 161) as i64 * 500;
    let customer = CUSTOMERS[seed % CUSTOMERS.len()];

    Booking::new(tenant_id, customer, total_minor, currency, Utc::now())
}
