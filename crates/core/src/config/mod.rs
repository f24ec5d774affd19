//! Configuration: YAML file with environment overrides.

mod loader;
mod types;
mod validate;

use std::sync::Arc;

pub use loader::{create_default_config, default_config_path, load_config, load_config_from_str};
pub use types::{
    Config, DownloaderConfig, GlobalConfig, LinkingConfig, ServerConfig, TargetSiteConfig,
    TimeoutConfig,
};
pub use validate::{validate_config, ConfigError};

use crate::sites::{infer_source_flag, GazelleHtml, GazelleJson, SiteError, TrackerSite};

/// Build the tracker site adapters declared in configuration. Sites are
/// constructed in declared order; an API key selects the JSON adapter, a
/// bare cookie the HTML one.
pub fn build_sites(config: &Config) -> Result<Vec<Arc<dyn TrackerSite>>, SiteError> {
    let mut sites: Vec<Arc<dyn TrackerSite>> = Vec::with_capacity(config.target_sites.len());
    for site in &config.target_sites {
        let host = url::Url::parse(&site.server)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| site.server.clone());
        let source_flag = site
            .source
            .clone()
            .unwrap_or_else(|| infer_source_flag(&host).to_string());

        let adapter: Arc<dyn TrackerSite> = if let Some(api_key) = &site.api_key {
            Arc::new(GazelleJson::new(
                &site.server,
                api_key,
                &site.tracker,
                &source_flag,
                site.max_concurrent,
                site.requests_per_minute,
                config.timeouts.search_secs,
            )?)
        } else if let Some(cookie) = &site.cookie {
            Arc::new(GazelleHtml::new(
                &site.server,
                cookie,
                &site.tracker,
                &source_flag,
                site.max_concurrent,
                site.requests_per_minute,
                config.timeouts.search_secs,
            )?)
        } else {
            // validate_config rejects this earlier.
            return Err(SiteError::Auth(format!(
                "site {} has neither api_key nor cookie",
                site.server
            )));
        };
        sites.push(adapter);
    }
    Ok(sites)
}
