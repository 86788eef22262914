use eyre::{Result, WrapErr};
use reqwest::Client;
use std::time::Duration;

const MAX_REDIRECTS: usize = 10;
const REDIRECT_TIMEOUT_SECS: u64 = 30;

/// Follows up to ten redirects starting at `url` and returns the hostname of
/// the last response.
pub async fn last_redirect_hostname(url: &str) -> Result<String> {
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(REDIRECT_TIMEOUT_SECS))
        .build()
        .wrap_err("Failed to build HTTP client")?;

    let response = client.get(url).send().await
        .wrap_err_with(|| format!("Failed to fetch {}", url))?;
    let hostname = response.url().host_str().unwrap_or_default().to_string();
    log::debug!("[target::redirect] last_redirect_hostname: url={} final_url={} hostname={}",
        url, response.url(), hostname);
    Ok(hostname)
}

/// A hostname belongs to a domain if the domain is a suffix of the hostname.
pub fn hostname_in_domain(hostname: &str, domain: &str) -> bool {
    hostname.to_lowercase().ends_with(&domain.to_lowercase())
}

/// Whether `url` ends up, after redirects, on a host inside `domain`. Also
/// returns the last hostname seen.
pub async fn is_redirecting_to(url: &str, domain: &str) -> Result<(bool, String)> {
    let hostname = last_redirect_hostname(url).await?;
    Ok((hostname_in_domain(&hostname, domain), hostname))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_in_domain() {
        assert!(hostname_in_domain("login.okta.com", "okta.com"));
        assert!(hostname_in_domain("Login.OKTA.com", "okta.COM"));
        assert!(!hostname_in_domain("login.example.com", "okta.com"));
    }

    #[tokio::test]
    async fn test_unreachable_url_is_an_error() {
        assert!(is_redirecting_to("http://127.0.0.1:1/", "example.com").await.is_err());
    }
}
