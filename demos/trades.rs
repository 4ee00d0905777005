use std::env::args;
use std::error::Error;
use steam_flue::auth::Credentials;
use steam_flue::client::{Event, SteamClient};
use steam_flue::trade::TradeEvent;
use steam_flue::NetConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = args().skip(1);
    let account = args.next().expect("no account");
    let password = args.next().expect("no password");
    let shared_secret = args.next().expect("no shared secret");
    let identity_secret = args.next().expect("no identity secret");
    let api_key = args.next().expect("no api key");

    let credentials = Credentials::new(account, password).with_shared_secret(shared_secret);
    let (client, mut events) = SteamClient::login(credentials, NetConfig::default()).await?;

    let engine = client.start_trades(api_key, Some(identity_secret));

    while let Some(event) = events.recv().await {
        match event {
            Event::Trade(TradeEvent::Receive(offer)) => {
                println!("incoming offer {offer}");
                if offer.is_gift() && offer.items_to_give.is_empty() {
                    println!("  free items, accepting");
                    engine.accept(&offer).await?;
                }
            }
            Event::Trade(TradeEvent::Accept(offer)) => {
                println!("offer {offer} went through");
            }
            Event::Trade(event) => println!("trade update: {event:?}"),
            Event::Connection(state) => println!("connection: {state:?}"),
            _ => {}
        }
    }

    Ok(())
}
