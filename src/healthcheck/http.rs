use super::HealthProbe;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

/// One shared client for every HTTP probe in the process. Services
/// under test routinely run with self-signed certificates, so TLS
/// verification is off; only a 200 counts as healthy.
static PROBE_CLIENT: OnceLock<Client> = OnceLock::new();

fn probe_client() -> &'static Client {
    PROBE_CLIENT.get_or_init(|| {
        Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default probe client configuration is valid")
    })
}

/// HTTP GET probe; status 200 means healthy.
pub struct HttpProbe {
    url: String,
}

impl HttpProbe {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> bool {
        match probe_client().get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                // Drain the body so the connection can be reused.
                let _ = response.bytes().await;
                status == reqwest::StatusCode::OK
            }
            Err(_) => false,
        }
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}
