use sqlx::postgres::PgPoolOptions;

use resonate::{service, CONFIG};

#[async_std::main]
async fn main() -> resonate::Result<()> {
    // try sourcing a .env if it exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&CONFIG.db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    service::start(pool).await?;
    Ok(())
}
