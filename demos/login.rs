use std::env::args;
use std::error::Error;
use steam_flue::auth::{Credentials, FileSentryStore};
use steam_flue::connection::Connection;
use steam_flue::serverlist::ServerList;
use steam_flue::WebClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = args().skip(1);
    let account = args.next().expect("no account");
    let password = args.next().expect("no password");
    let shared_secret = args.next();

    let mut credentials = Credentials::new(account, password);
    if let Some(shared_secret) = shared_secret {
        credentials = credentials.with_shared_secret(shared_secret);
    }

    let server_list = ServerList::discover().await?;
    let web = WebClient::new();
    let connection = Connection::login(
        &server_list,
        &credentials,
        FileSentryStore::new("sentry.json"),
        &web,
    )
    .await?;

    println!(
        "logged on as {} (session {})",
        connection.steam_id(),
        connection.session_id()
    );
    if let Some(country) = connection.ip_country_code() {
        println!("connected from {country}");
    }

    connection.logoff().await?;
    Ok(())
}
