use tokio::io::AsyncReadExt;

use crate::config::PublishArgs;
use crate::error::ServerError;
use offer_api::Offer;
use transport_nats::NatsTransport;

/// Отправить один offer в stream. Печатает sequence, присвоенный JetStream.
pub async fn run(args: PublishArgs) -> Result<(), ServerError> {
    let payload = match args.payload {
        Some(text) => text.into_bytes(),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };

    // Consumer не подтвердит такое сообщение, поэтому по умолчанию
    // отказываем до отправки.
    if !args.raw {
        let offer = Offer::from_slice(&payload)?;
        let key = offer.key()?;
        tracing::debug!(%key, "payload validated");
    }

    let transport = NatsTransport::connect(&args.nats_url, "offer-cacher-publish").await?;
    let seq = transport.publish(&args.subject, payload).await?;
    tracing::info!(subject = %args.subject, seq, url = %transport.url(), "offer published");
    println!("{seq}");
    Ok(())
}
