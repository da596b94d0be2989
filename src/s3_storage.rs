//! `RemoteStorage` on top of an S3-compatible bucket.
//!
//! S3 has no rename, so renames copy every blob (whole file and
//! parts) before deleting the sources.
use derivative::Derivative;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain_error;
use crate::chain_transient;
use crate::fresh_info;
use crate::remote::check_cancelled;
use crate::remote::part_blob_path;
use crate::remote::RemoteEntry;
use crate::remote::RemoteStorage;
use crate::remote_target::parse_s3_region_specification;
use crate::remote_target::S3RemoteTarget;
use crate::result::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Derivative)]
#[derivative(Debug)]
pub struct S3Storage {
    // The bucket holds our credentials.
    #[derivative(Debug = "ignore")]
    bucket: Bucket,
    bucket_name: String,
    prefix: String,
}

/// Maps a rust-s3 response to our error taxonomy: socket-level
/// errors, 5xx and 429 responses are transient, other non-2xx
/// codes are permanent.  `missing_ok` treats 404 as success.
fn check_response<E: std::fmt::Debug + 'static>(
    response: std::result::Result<(Vec<u8>, u16), E>,
    what: &'static str,
    key: &str,
    missing_ok: bool,
) -> Result<Option<Vec<u8>>> {
    match response {
        Ok((body, code)) if (200..300).contains(&code) => Ok(Some(body)),
        Ok((_, 404)) if missing_ok => Ok(None),
        Ok((body, code)) if code >= 500 || code == 429 => Err(chain_transient!(
            (String::from_utf8_lossy(&body).into_owned(), code),
            "transient S3 failure",
            %what,
            %key
        )),
        Ok((body, code)) => Err(chain_error!(
            (String::from_utf8_lossy(&body).into_owned(), code),
            "S3 request rejected",
            %what,
            %key
        )),
        Err(e) => Err(chain_transient!(e, "S3 request failed", %what, %key)),
    }
}

impl S3Storage {
    #[instrument(err)]
    pub fn new(target: &S3RemoteTarget) -> Result<S3Storage> {
        let creds =
            Credentials::default().map_err(|e| chain_error!(e, "failed to get credentials"))?;
        let region = parse_s3_region_specification(&target.region, target.endpoint.as_deref());

        let mut bucket = Bucket::new(&target.bucket, region, creds)
            .map_err(|e| chain_error!(e, "failed to create S3 bucket object", ?target))?;

        if target.domain_addressing {
            bucket.set_subdomain_style();
        } else {
            bucket.set_path_style();
        }

        bucket.set_request_timeout(Some(REQUEST_TIMEOUT));

        Ok(S3Storage {
            bucket,
            bucket_name: target.bucket.clone(),
            prefix: target.prefix.clone(),
        })
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path.trim_start_matches('/'))
    }

    fn put(&self, key: &str, contents: &[u8]) -> Result<()> {
        check_response(
            self.bucket.put_object_blocking(key, contents),
            "put",
            key,
            false,
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_response(self.bucket.delete_object_blocking(key), "delete", key, true)?;
        Ok(())
    }

    /// Copies the blob at `from` to `to`.  Returns false if there
    /// was no blob at `from`.
    fn copy(&self, from: &str, to: &str) -> Result<bool> {
        match check_response(self.bucket.get_object_blocking(from), "get", from, true)? {
            Some(contents) => {
                self.put(to, &contents)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl RemoteStorage for S3Storage {
    #[instrument(level = "debug", skip(contents, cancel), fields(len = contents.len(), bucket = %self.bucket_name), err)]
    fn upload_whole(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        check_cancelled(cancel)?;
        self.put(&self.key(path), contents)?;
        Ok(None)
    }

    #[instrument(level = "debug", skip(contents, cancel), fields(len = contents.len(), bucket = %self.bucket_name), err)]
    fn upload_part(
        &self,
        path: &str,
        part: u32,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        check_cancelled(cancel)?;
        self.put(&self.key(&part_blob_path(path, part)), contents)?;
        Ok(None)
    }

    #[instrument(level = "debug", skip(cancel), fields(bucket = %self.bucket_name), err)]
    fn delete_whole(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.delete(&self.key(path))
    }

    #[instrument(level = "debug", skip(cancel), fields(bucket = %self.bucket_name), err)]
    fn delete_part(&self, path: &str, part: u32, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        self.delete(&self.key(&part_blob_path(path, part)))
    }

    #[instrument(level = "debug", skip(cancel), fields(bucket = %self.bucket_name), err)]
    fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;

        let part_prefix = format!("{}.part", from);
        let mut sources = vec![from.to_string()];
        for entry in self.list(&part_prefix, cancel)? {
            if entry.path[part_prefix.len()..].parse::<u32>().is_ok() {
                sources.push(entry.path);
            }
        }

        let mut copied = Vec::new();
        for source in sources {
            check_cancelled(cancel)?;

            let destination = format!("{}{}", to, &source[from.len()..]);
            if self.copy(&self.key(&source), &self.key(&destination))? {
                copied.push(source);
            }
        }

        if copied.is_empty() {
            return Err(fresh_info!("no blob to rename", %from, %to));
        }

        for source in copied {
            self.delete(&self.key(&source))?;
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(cancel), fields(bucket = %self.bucket_name), err)]
    fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<RemoteEntry>> {
        check_cancelled(cancel)?;

        let full_prefix = self.key(prefix);
        let pages = self
            .bucket
            .list_blocking(full_prefix.clone(), None)
            .map_err(|e| chain_transient!(e, "failed to list S3 bucket", prefix=%full_prefix))?;

        let mut ret = Vec::new();
        for page in pages {
            for object in page.contents {
                if let Some(path) = object.key.strip_prefix(self.prefix.as_str()) {
                    ret.push(RemoteEntry {
                        path: path.to_string(),
                        size: object.size,
                    });
                }
            }
        }

        ret.sort();
        Ok(ret)
    }
}

#[test]
fn test_check_response_classification() {
    type Raw = std::result::Result<(Vec<u8>, u16), String>;

    let ok: Raw = Ok((b"body".to_vec(), 200));
    assert_eq!(
        check_response(ok, "get", "k", false).expect("should succeed"),
        Some(b"body".to_vec())
    );

    let missing: Raw = Ok((Vec::new(), 404));
    assert_eq!(
        check_response(missing.clone(), "delete", "k", true).expect("should succeed"),
        None
    );
    assert!(!check_response(missing, "get", "k", false)
        .expect_err("should fail")
        .is_transient());

    for code in [500u16, 503, 429] {
        let raw: Raw = Ok((Vec::new(), code));
        assert!(check_response(raw, "put", "k", false)
            .expect_err("should fail")
            .is_transient());
    }

    let forbidden: Raw = Ok((Vec::new(), 403));
    assert!(!check_response(forbidden, "put", "k", false)
        .expect_err("should fail")
        .is_transient());

    let socket: Raw = Err("connection reset".into());
    assert!(check_response(socket, "put", "k", false)
        .expect_err("should fail")
        .is_transient());
}
