//! A remote target tells snapvault where to send file contents and
//! cache batches.
//!
//! Targets only describe location, not credentials: S3 credentials
//! come from the environment (see `s3::creds::Credentials::default`).
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::remote::LocalDirectoryStorage;
use crate::remote::RemoteStorage;
use crate::result::Result;
use crate::s3_storage::S3Storage;

/// A S3 remote target stores everything in one S3-compatible
/// bucket, under an optional key prefix.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct S3RemoteTarget {
    /// Region for the blob store.  Either one of the hardcoded strings
    /// supported by Rust-S3 (https://github.com/durch/rust-s3/blob/0.26.3/aws-region/src/region.rs#L132-L160),
    /// or a local domain like "minio".
    pub region: String,

    /// Endpoint override for custom regions, e.g.,
    /// "http://127.0.0.1:9000".  Targets with custom regions should
    /// specify an endpoint, but if they don't, the endpoint will
    /// default to the same string as the region.
    #[serde(default)]
    pub endpoint: Option<String>,

    pub bucket: String,

    /// Prepended to every key, e.g., "hostname/".
    #[serde(default)]
    pub prefix: String,

    /// If true, address buckets as subdomains (modern); otherwise,
    /// use the legacy bucket-as-path mode.
    pub domain_addressing: bool,
}

/// A local remote target mirrors everything under a directory;
/// mostly useful for tests and for staging to a mounted volume.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct LocalRemoteTarget {
    pub directory: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTarget {
    S3(S3RemoteTarget),
    Local(LocalRemoteTarget),
}

impl RemoteTarget {
    /// Instantiates the remote storage client for this target.
    #[tracing::instrument(err)]
    pub fn build(&self) -> Result<Arc<dyn RemoteStorage>> {
        match self {
            RemoteTarget::S3(s3) => Ok(Arc::new(S3Storage::new(s3)?)),
            RemoteTarget::Local(local) => Ok(Arc::new(LocalDirectoryStorage::new(PathBuf::from(
                &local.directory,
            ))?)),
        }
    }
}

/// Parses a S3-compatible region specification from a region and an
/// optional endpoint.
///
/// If the endpoint is provided, we use that region name and endpoint
/// verbatim.
///
/// Otherwise, we use the region if it's known to our S3 crate (e.g.,
/// standard AWS or yandex regions).
///
/// Finally, if we only have a non-standard region, we try to parse it
/// as a custom region / HTTPS endpoint pair, of the form
/// `region-name.domain.for.https.endpoint`; if there is no dot in the
/// "region" name, we assume the endpoint matches the region name
/// (e.g., when deployed to a local undotted domain entry).
pub(crate) fn parse_s3_region_specification(region: &str, endpoint: Option<&str>) -> s3::Region {
    if let Some(endpoint) = endpoint {
        return s3::Region::Custom {
            region: region.to_owned(),
            endpoint: endpoint.to_owned(),
        };
    }

    match region.parse() {
        Ok(region) if !matches!(region, s3::Region::Custom { .. }) => region,
        _ => {
            let (region_name, endpoint) = match region.split_once('.') {
                Some(pair) => pair,
                None => (region, region),
            };

            let endpoint = format!("https://{}", endpoint);
            tracing::debug!(string=%region, region=%region_name, %endpoint,
                            "unknown S3 region; assuming it is a custom `region[.endpoint]`.");
            s3::Region::Custom {
                region: region_name.to_owned(),
                endpoint,
            }
        }
    }
}

#[test]
fn test_serialization_smoke_test() {
    let target = RemoteTarget::S3(S3RemoteTarget {
        region: "minio".into(),
        endpoint: Some("http://127.0.0.1:9000".into()),
        bucket: "backups".into(),
        prefix: "host/".into(),
        domain_addressing: true,
    });

    let expected = "{\"s3\":{\"region\":\"minio\",\"endpoint\":\"http://127.0.0.1:9000\",\"bucket\":\"backups\",\"prefix\":\"host/\",\"domain_addressing\":true}}";

    assert_eq!(
        serde_json::to_string(&target).expect("should serialize"),
        expected
    );

    assert_eq!(
        serde_json::from_str::<RemoteTarget>(expected).expect("should deserialize"),
        target
    );

    let local: RemoteTarget =
        serde_json::from_str("{\"local\":{\"directory\":\"/tmp/remote\"}}").expect("should parse");
    assert_eq!(
        local,
        RemoteTarget::Local(LocalRemoteTarget {
            directory: "/tmp/remote".into()
        })
    );
}

#[test]
fn test_parse_region() {
    let explicit = parse_s3_region_specification("minio", Some("http://127.0.0.1:9000"));
    assert!(
        matches!(&explicit, s3::Region::Custom { region, endpoint }
                 if region == "minio" && endpoint == "http://127.0.0.1:9000"),
        "{:?}",
        explicit
    );

    let custom = parse_s3_region_specification("backup.example.com", None);
    assert!(
        matches!(&custom, s3::Region::Custom { region, endpoint }
                 if region == "backup" && endpoint == "https://example.com"),
        "{:?}",
        custom
    );

    assert!(matches!(
        parse_s3_region_specification("us-east-1", None),
        s3::Region::UsEast1
    ));
}
