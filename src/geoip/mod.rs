pub mod countries;
pub mod geohash;

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::config::{GeoIpConfig, GeoSupplier};

/// Location labels attached to a client's metric series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoLocation {
    pub geohash: String,
    pub country: String,
    pub location: String,
}

impl GeoLocation {
    /// Labels for a failed or impossible lookup.
    pub fn unknown() -> Self {
        Self {
            geohash: "s000".to_string(),
            country: "Unknown".to_string(),
            location: "Unknown".to_string(),
        }
    }

    /// Labels used when lookups are disabled.
    pub fn disabled() -> Self {
        Self {
            geohash: "s000".to_string(),
            country: "Geohash off".to_string(),
            location: "Geohash off".to_string(),
        }
    }
}

/// Resolves client IPs to location labels through the configured supplier.
///
/// Lookups are strictly best-effort: a failure here must never take the
/// tarpit down, so backend setup problems degrade the resolver instead of
/// erroring out of construction.
pub struct GeoResolver {
    supplier: GeoSupplier,
    http: Option<reqwest::Client>,
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoResolver {
    pub fn new(cfg: &GeoIpConfig) -> Self {
        let http = match cfg.supplier {
            GeoSupplier::IpApi => {
                match reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                {
                    Ok(client) => Some(client),
                    Err(e) => {
                        warn!(error = %e, "building ip-api HTTP client failed; lookups disabled");
                        None
                    }
                }
            }
            _ => None,
        };

        let reader = match cfg.supplier {
            GeoSupplier::MaxMindDb => {
                match maxminddb::Reader::open_readfile(&cfg.max_mind_db) {
                    Ok(reader) => Some(reader),
                    Err(e) => {
                        warn!(
                            error = %e,
                            path = %cfg.max_mind_db,
                            "opening MaxMind database failed; lookups disabled",
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        Self {
            supplier: cfg.supplier,
            http,
            reader,
        }
    }

    /// Resolve an IP to location labels. The caller substitutes
    /// [`GeoLocation::unknown`] on error.
    pub async fn resolve(&self, ip: &str) -> Result<GeoLocation> {
        match self.supplier {
            GeoSupplier::Off => Ok(GeoLocation::disabled()),
            GeoSupplier::IpApi => self.resolve_ip_api(ip).await,
            GeoSupplier::MaxMindDb => self.resolve_max_mind(ip),
        }
    }

    async fn resolve_ip_api(&self, ip: &str) -> Result<GeoLocation> {
        let Some(http) = &self.http else {
            bail!("ip-api client unavailable");
        };

        let url = format!("http://ip-api.com/json/{ip}");
        let response = http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("querying ip-api for {ip}"))?;

        let geo: IpApiResponse = response
            .json()
            .await
            .context("decoding ip-api response")?;

        if geo.status != "success" {
            bail!(
                "ip-api query for {} failed: status {}, message {}",
                ip,
                geo.status,
                geo.message,
            );
        }

        Ok(GeoLocation {
            geohash: geohash::encode_auto(geo.lat, geo.lon),
            country: compose_country(&geo.country),
            location: compose_location(&geo.country, &geo.region_name, &geo.city),
        })
    }

    fn resolve_max_mind(&self, ip: &str) -> Result<GeoLocation> {
        let Some(reader) = &self.reader else {
            bail!("MaxMind database unavailable");
        };

        let addr: IpAddr = ip.parse().with_context(|| format!("parsing client ip {ip}"))?;
        let record: maxminddb::geoip2::City = reader
            .lookup(addr)
            .with_context(|| format!("looking up {ip} in MaxMind database"))?;

        let mut country_name = record
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .copied()
            .unwrap_or("")
            .to_string();
        let city_name = record
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .copied()
            .unwrap_or("");
        let iso = record
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .unwrap_or("");

        let mut latitude = record
            .location
            .as_ref()
            .and_then(|l| l.latitude)
            .unwrap_or(0.0);
        let mut longitude = record
            .location
            .as_ref()
            .and_then(|l| l.longitude)
            .unwrap_or(0.0);

        if latitude == 0.0 && longitude == 0.0 {
            // Country databases carry no coordinates; fall back to the
            // country centroid, or tag the name with the ISO code so the
            // gap shows up in the labels.
            match countries::centroid(iso) {
                Some((lat, lon)) => {
                    latitude = lat;
                    longitude = lon;
                }
                None => {
                    if !iso.is_empty() {
                        country_name = format!("{country_name} ({iso})");
                    }
                }
            }
        }

        Ok(GeoLocation {
            geohash: geohash::encode_auto(latitude, longitude),
            country: compose_country(&country_name),
            location: compose_location(&country_name, "", city_name),
        })
    }
}

/// JSON shape of an ip-api.com response; unused fields are ignored.
#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    country: String,
    #[serde(default, rename = "regionName")]
    region_name: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
}

fn compose_country(country: &str) -> String {
    if country.trim().is_empty() {
        "Unknown".to_string()
    } else {
        country.to_string()
    }
}

fn compose_location(country: &str, region: &str, city: &str) -> String {
    let parts: Vec<&str> = [country, region, city]
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if parts.is_empty() {
        "Unknown".to_string()
    } else {
        parts.join(", ")
    }
}
