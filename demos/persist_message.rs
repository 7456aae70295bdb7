//! Persists one assistant reply using the credential in `DOCSTORE_SERVICE_ACCOUNT`.
//!
//! Run with a service-identity JSON document (raw or base64) exported in the environment:
//!
//! ```sh
//! DOCSTORE_SERVICE_ACCOUNT="$(cat key.json)" cargo run --example persist_message -- user-1 session-1
//! ```

// std
use std::env;
// crates.io
use color_eyre::Result;
// self
use docstore_broker::{
	auth::{CredentialLoader, ScopeSet},
	endpoint::EndpointDescriptor,
	flows::Broker,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let mut args = env::args().skip(1);
	let user = args.next().unwrap_or_else(|| "demo-user".into());
	let session = args.next().unwrap_or_else(|| "demo-session".into());
	let broker =
		Broker::new(EndpointDescriptor::builder().build()?, CredentialLoader::from_default_env())?;
	let token = broker.get_token(&ScopeSet::datastore()).await?;

	println!("Token acquired: {token:?}.");

	let name = broker.persist_assistant_message(&user, &session, "Hello from the broker.").await?;

	println!("Stored {name}.");

	match broker.persist_or_notice(&user, &session, "A second reply.").await {
		Ok(name) => println!("Stored {name}."),
		Err(notice) => println!("{notice}"),
	}

	Ok(())
}
