//! The injected resolution capability.
//!
//! The exchange core only specifies transport and dispatch; what a given
//! `IoSpec` actually opens (bind this port, open that path) is owned by
//! the resolver supplied at server construction. Resolution runs
//! synchronously on the dispatch thread, so a slow resolver stalls
//! servicing of all connections until it returns.

use std::os::fd::OwnedFd;

use super::protocol::{IoSpec, ResolveError};

/// Turns a request specification into a live descriptor or an error.
pub trait Resolver: Send + Sync {
    fn resolve(&self, spec: &IoSpec) -> Result<OwnedFd, ResolveError>;
}

impl<F> Resolver for F
where
    F: Fn(&IoSpec) -> Result<OwnedFd, ResolveError> + Send + Sync,
{
    fn resolve(&self, spec: &IoSpec) -> Result<OwnedFd, ResolveError> {
        self(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_closure_acts_as_resolver() {
        let resolver = |spec: &IoSpec| -> Result<OwnedFd, ResolveError> {
            match spec {
                IoSpec::Named { name } if name == "loopback" => {
                    let (a, _b) = UnixStream::pair().map_err(|e| ResolveError::io(&e))?;
                    Ok(a.into())
                }
                other => Err(ResolveError::Unsupported(format!("{other:?}"))),
            }
        };

        assert!(resolver.resolve(&IoSpec::named("loopback")).is_ok());
        assert!(matches!(
            resolver.resolve(&IoSpec::named("bogus")),
            Err(ResolveError::Unsupported(_))
        ));
    }
}
