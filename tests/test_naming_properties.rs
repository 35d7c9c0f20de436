//! Property tests for physical name qualification

use burrow::config::{BrokerConfig, NamespaceSetting, VhostConfig};
use burrow::naming::{qualify, Namespace};
use burrow::topology::ResolvedTopology;
use proptest::prelude::*;

fn vhost(name: &str, namespace: &str) -> VhostConfig {
    let mut config = BrokerConfig::from_toml_str(&format!("[[vhosts]]\nname = \"{name}\""))
        .unwrap()
        .vhosts
        .remove(0);
    config.namespace = Some(NamespaceSetting::Fixed(namespace.to_string()));
    config
}

proptest! {
    #[test]
    fn qualified_name_is_namespace_colon_name(
        namespace in "[a-zA-Z0-9._-]{1,32}",
        name in "[a-zA-Z0-9._:-]{1,64}"
    ) {
        prop_assert_eq!(qualify(Some(namespace.as_str()), &name), format!("{}:{}", namespace, name));
    }

    #[test]
    fn qualification_is_deterministic(
        namespace in "[a-z]{1,16}",
        name in ".{1,32}"
    ) {
        let fixed = Namespace::fixed(namespace.clone());
        prop_assert_eq!(fixed.qualify(&name), fixed.qualify(&name));
        prop_assert_eq!(fixed.qualify(&name), qualify(Some(namespace.as_str()), &name));
    }

    #[test]
    fn absent_namespace_leaves_names_unchanged(name in ".{0,32}") {
        prop_assert_eq!(qualify(None, &name), name.clone());
        prop_assert_eq!(Namespace::none().qualify(&name), name);
    }

    #[test]
    fn resolved_vhost_qualifies_like_the_pure_function(
        vhost_name in "[a-z]{1,12}",
        namespace in "[a-z]{1,12}",
        name in "[a-z]{1,24}"
    ) {
        let config = BrokerConfig { vhosts: vec![vhost(&vhost_name, &namespace)] };
        let topology = ResolvedTopology::resolve(&config).unwrap();
        let resolved = topology.vhost(&vhost_name).unwrap();
        prop_assert_eq!(resolved.qualify(&name), format!("{}:{}", namespace, name));
    }
}

#[test]
fn empty_name_addresses_default_exchange() {
    assert_eq!(qualify(Some("ns"), ""), "");
}
