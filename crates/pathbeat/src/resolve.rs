//! Address classification and name resolution

use std::net::IpAddr;

use tokio::net::lookup_host;

use pathbeat_common::{AddressFamily, Error, Result};

/// Resolve a hostname or IP literal to a list of addresses.
///
/// Literals short-circuit without touching the resolver; a literal that
/// contradicts the requested family fails the lookup. Without a family,
/// IPv4 results are preferred and IPv6 is the fallback. Always returns
/// at least one address or [`Error::NameLookup`].
pub async fn async_resolve(name: &str, family: Option<AddressFamily>) -> Result<Vec<IpAddr>> {
    if let Ok(address) = name.parse::<IpAddr>() {
        if let Some(family) = family {
            if AddressFamily::of(address) != family {
                return Err(Error::NameLookup(name.to_string()));
            }
        }

        return Ok(vec![address]);
    }

    let addresses: Vec<IpAddr> = lookup_host((name, 0))
        .await
        .map_err(|_| Error::NameLookup(name.to_string()))?
        .map(|addr| addr.ip())
        .collect();

    let selected: Vec<IpAddr> = match family {
        Some(AddressFamily::V4) => addresses.into_iter().filter(IpAddr::is_ipv4).collect(),
        Some(AddressFamily::V6) => addresses.into_iter().filter(IpAddr::is_ipv6).collect(),
        None => {
            let v4: Vec<IpAddr> = addresses.iter().copied().filter(IpAddr::is_ipv4).collect();
            if v4.is_empty() {
                addresses.into_iter().filter(IpAddr::is_ipv6).collect()
            } else {
                v4
            }
        }
    };

    if selected.is_empty() {
        return Err(Error::NameLookup(name.to_string()));
    }

    Ok(selected)
}

/// Blocking variant of [`async_resolve`].
pub fn resolve(name: &str, family: Option<AddressFamily>) -> Result<Vec<IpAddr>> {
    crate::runtime::block_on(async_resolve(name, family))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn test_ipv4_literal() {
        let addresses = async_resolve("127.0.0.1", None).await.unwrap();
        assert_eq!(addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }

    #[tokio::test]
    async fn test_ipv6_literal() {
        let addresses = async_resolve("::1", Some(AddressFamily::V6)).await.unwrap();
        assert_eq!(addresses, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }

    #[tokio::test]
    async fn test_literal_with_wrong_family() {
        let result = async_resolve("127.0.0.1", Some(AddressFamily::V6)).await;
        assert!(matches!(result, Err(Error::NameLookup(_))));
    }

    #[tokio::test]
    async fn test_unresolvable_name() {
        let result = async_resolve("host.invalid", None).await;
        assert!(matches!(result, Err(Error::NameLookup(_))));
    }

    #[test]
    fn test_blocking_resolve() {
        let addresses = resolve("::1", None).unwrap();
        assert_eq!(addresses, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }
}
