use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

use subscout::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_term>", args[0]);
        eprintln!("Search term matches against vendor, sender, or subject.");
        std::process::exit(1);
    }

    let term = &args[1];
    let search_term = format!("%{}%", term);

    let config = Config::load();
    let pool = SqlitePoolOptions::new()
        .connect(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let row = sqlx::query(
        "SELECT id, user_id, message_id, vendor_name, raw_vendor, confidence, amount, currency,
                billing_cycle, renewal_date, transaction_types, status, signals, subject, sender,
                received_at
         FROM subscription_candidates
         WHERE vendor_name LIKE ? OR sender LIKE ? OR subject LIKE ?
         ORDER BY received_at DESC
         LIMIT 1",
    )
    .bind(&search_term)
    .bind(&search_term)
    .bind(&search_term)
    .fetch_optional(&pool)
    .await?;

    let Some(row) = row else {
        println!("No candidates found matching '{}'", term);
        return Ok(());
    };

    let received_at: i64 = row.get("received_at");
    let signals: String = row.get("signals");
    let signals: Vec<String> = serde_json::from_str(&signals).unwrap_or_default();

    println!("Found Candidate:");
    println!("ID: {}", row.get::<String, _>("id"));
    println!("User: {}", row.get::<String, _>("user_id"));
    println!("Message: {}", row.get::<String, _>("message_id"));
    println!("Status: {}", row.get::<String, _>("status"));
    println!(
        "Vendor: {} (raw: {:?})",
        row.get::<String, _>("vendor_name"),
        row.get::<String, _>("raw_vendor")
    );
    println!("Confidence: {}", row.get::<i64, _>("confidence"));
    println!(
        "Amount: {:?} {:?}",
        row.get::<Option<f64>, _>("amount"),
        row.get::<Option<String>, _>("currency")
    );
    println!("Billing cycle: {}", row.get::<String, _>("billing_cycle"));
    println!("Renewal date: {:?}", row.get::<Option<String>, _>("renewal_date"));
    println!("Transaction types: {}", row.get::<String, _>("transaction_types"));
    println!(
        "Received: {}",
        chrono::DateTime::from_timestamp_millis(received_at)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| received_at.to_string())
    );
    println!(
        "--------------------------------------------------------------------------------"
    );
    println!("From: {:?}", row.get::<String, _>("sender"));
    println!("Subject: {:?}", row.get::<String, _>("subject"));
    println!(
        "--------------------------------------------------------------------------------"
    );
    println!("SIGNALS:");
    for signal in &signals {
        println!("  - {}", signal);
    }

    Ok(())
}
