//! Total order over services
//!
//! Connected first (online over ready), then connecting, then the explicit
//! order attribute, favorites, per-type preference and signal strength.
//! Services whose states differ but are neither connected nor connecting
//! rank equal on the state key and fall through to the later keys.

use super::types::ServiceType;
use super::Service;
use std::cmp::Ordering;

pub fn compare(a: &Service, b: &Service) -> Ordering {
    if a.state != b.state {
        let a_connected = a.state.is_connected();
        let b_connected = b.state.is_connected();

        if a_connected && b_connected {
            // Online outranks ready.
            if a.state == super::types::ServiceState::Online {
                return Ordering::Less;
            }
            if b.state == super::types::ServiceState::Online {
                return Ordering::Greater;
            }
        }

        if a_connected {
            return Ordering::Less;
        }
        if b_connected {
            return Ordering::Greater;
        }

        if a.state.is_connecting() {
            return Ordering::Less;
        }
        if b.state.is_connecting() {
            return Ordering::Greater;
        }
    }

    match b.order.cmp(&a.order) {
        Ordering::Equal => {}
        other => return other,
    }

    match (a.favorite, b.favorite) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    if a.service_type != b.service_type {
        match type_rank(a.service_type).cmp(&type_rank(b.service_type)) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    b.strength.cmp(&a.strength)
}

/// Wimax/bluetooth/cellular outrank the middle of the field; wifi sits at
/// the bottom of otherwise-equal entries.
fn type_rank(service_type: ServiceType) -> u8 {
    match service_type {
        ServiceType::Wimax | ServiceType::Bluetooth | ServiceType::Cellular => 0,
        ServiceType::Unknown
        | ServiceType::System
        | ServiceType::Ethernet
        | ServiceType::Gps
        | ServiceType::Vpn
        | ServiceType::Gadget => 1,
        ServiceType::Wifi => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{ServiceState, ServiceType};
    use super::super::Service;
    use super::*;

    fn service(ident: &str) -> Service {
        Service::for_tests(ident, ServiceType::Wifi)
    }

    #[test]
    fn test_connected_before_everything() {
        let mut a = service("a");
        a.state = ServiceState::Ready;
        let mut b = service("b");
        b.state = ServiceState::Association;
        b.favorite = true;
        b.strength = 100;

        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_online_outranks_ready() {
        let mut a = service("a");
        a.state = ServiceState::Ready;
        let mut b = service("b");
        b.state = ServiceState::Online;

        assert_eq!(compare(&a, &b), Ordering::Greater);
        assert_eq!(compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_order_attribute_dominates_favorite() {
        let mut a = service("a");
        a.favorite = true;
        let mut b = service("b");
        b.order = 10; // VPN favorites carry the top order

        assert_eq!(compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_favorites_before_others() {
        let mut a = service("a");
        a.favorite = true;
        let b = service("b");

        assert_eq!(compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_cellular_preferred_over_wifi_at_equal_rank() {
        let wifi = service("wifi");
        let mut cell = service("cell");
        cell.service_type = ServiceType::Cellular;

        assert_eq!(compare(&wifi, &cell), Ordering::Greater);
        assert_eq!(compare(&cell, &wifi), Ordering::Less);
    }

    #[test]
    fn test_type_rank_is_antisymmetric() {
        let wifi = service("wifi");
        let mut eth = service("eth");
        eth.service_type = ServiceType::Ethernet;

        assert_eq!(compare(&wifi, &eth), Ordering::Greater);
        assert_eq!(compare(&eth, &wifi), Ordering::Less);
    }

    #[test]
    fn test_strength_descending() {
        let mut a = service("a");
        a.strength = 80;
        let mut b = service("b");
        b.strength = 40;

        assert_eq!(compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_divergent_inactive_states_fall_through() {
        // failure vs disconnect is not a ranking signal; strength decides.
        let mut a = service("a");
        a.state = ServiceState::Failure;
        a.strength = 90;
        let mut b = service("b");
        b.state = ServiceState::Disconnect;
        b.strength = 10;

        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
    }
}
