//! Path-based upstream selection: prefix matching, probability gating for
//! ungrouped upstreams, and weighted pick-one-per-group.

use std::collections::BTreeMap;

use rand::Rng;

use crate::config::UpstreamConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Upstreams are configured with path matches, but none matched the
    /// request path. The handler answers 404.
    NoMatch,
    /// Indices into the configured upstream list, in configuration order.
    /// May be empty (no upstreams configured, or probability gates all
    /// declined) in which case the service acts as a leaf.
    Selected(Vec<usize>),
}

/// Select the upstreams to call for one request.
pub fn select_upstreams<R: Rng>(
    upstreams: &[UpstreamConfig],
    path: &str,
    request_weights: Option<&BTreeMap<String, u32>>,
    rng: &mut R,
) -> RouteOutcome {
    if upstreams.is_empty() {
        return RouteOutcome::Selected(Vec::new());
    }

    let eligible: Vec<usize> = upstreams
        .iter()
        .enumerate()
        .filter(|(_, u)| {
            u.match_prefixes.is_empty()
                || u.match_prefixes.iter().any(|p| path.starts_with(p.as_str()))
        })
        .map(|(i, _)| i)
        .collect();
    if eligible.is_empty() {
        return RouteOutcome::NoMatch;
    }

    let mut selected: Vec<usize> = Vec::new();
    // Groups keyed by name, in first-appearance order.
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for &i in &eligible {
        match &upstreams[i].group {
            Some(group) => {
                if let Some((_, members)) = groups.iter_mut().find(|(name, _)| *name == group) {
                    members.push(i);
                } else {
                    groups.push((group, vec![i]));
                }
            }
            None => {
                let p = upstreams[i].probability;
                if p <= 0.0 || rng.gen::<f64>() < p {
                    selected.push(i);
                }
            }
        }
    }

    for (_, members) in &groups {
        selected.push(pick_weighted(upstreams, members, request_weights, rng));
    }

    selected.sort_unstable();
    RouteOutcome::Selected(selected)
}

/// Pick exactly one group member by weighted random selection.
///
/// Request-provided weights win over configured weights. When only some
/// members carry weights, the remainder of a nominal total of 100 is
/// split equally among the unweighted; when nobody carries a weight the
/// pick is uniform.
fn pick_weighted<R: Rng>(
    upstreams: &[UpstreamConfig],
    members: &[usize],
    request_weights: Option<&BTreeMap<String, u32>>,
    rng: &mut R,
) -> usize {
    let effective: Vec<Option<u64>> = members
        .iter()
        .map(|&i| {
            let upstream = &upstreams[i];
            request_weights
                .and_then(|w| w.get(&upstream.name).copied())
                .or(upstream.weight)
                .map(u64::from)
        })
        .collect();

    let resolved: Vec<u64> = if effective.iter().all(Option::is_none) {
        vec![1; members.len()]
    } else {
        let assigned: u64 = effective.iter().flatten().sum();
        let unweighted = effective.iter().filter(|w| w.is_none()).count() as u64;
        let share = if unweighted > 0 {
            100u64.saturating_sub(assigned) / unweighted
        } else {
            0
        };
        let resolved: Vec<u64> = effective
            .iter()
            .map(|w| w.unwrap_or(share))
            .collect();
        if resolved.iter().sum::<u64>() == 0 {
            vec![1; members.len()]
        } else {
            resolved
        }
    };

    let total: u64 = resolved.iter().sum();
    let mut draw = rng.gen_range(0..total);
    for (k, &w) in resolved.iter().enumerate() {
        if draw < w {
            return members[k];
        }
        draw -= w;
    }
    members[members.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_upstreams;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn selected(outcome: RouteOutcome) -> Vec<usize> {
        match outcome {
            RouteOutcome::Selected(v) => v,
            RouteOutcome::NoMatch => panic!("unexpected NoMatch"),
        }
    }

    #[test]
    fn no_upstreams_is_a_leaf() {
        let out = select_upstreams(&[], "/anything", None, &mut rng());
        assert_eq!(out, RouteOutcome::Selected(vec![]));
    }

    #[test]
    fn catch_all_always_eligible() {
        let ups = parse_upstreams("a=http://a:8080|b=http://b:8080").unwrap();
        let out = selected(select_upstreams(&ups, "/whatever", None, &mut rng()));
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn prefix_match_selects_subset() {
        let ups = parse_upstreams(
            "a=http://a:8080:match=/orders|b=http://b:8080:match=/products",
        )
        .unwrap();
        let out = selected(select_upstreams(&ups, "/orders/42", None, &mut rng()));
        assert_eq!(out, vec![0]);
        let out = selected(select_upstreams(&ups, "/products", None, &mut rng()));
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn unmatched_path_with_matchers_is_404() {
        let ups = parse_upstreams(
            "a=http://a:8080:match=/orders|b=http://b:8080:match=/products",
        )
        .unwrap();
        let out = select_upstreams(&ups, "/unknown", None, &mut rng());
        assert_eq!(out, RouteOutcome::NoMatch);
    }

    #[test]
    fn catch_all_prevents_404() {
        let ups =
            parse_upstreams("a=http://a:8080:match=/orders|b=http://b:8080").unwrap();
        let out = selected(select_upstreams(&ups, "/unknown", None, &mut rng()));
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn zero_probability_means_always() {
        let ups = parse_upstreams("a=http://a:8080:probability=0").unwrap();
        for _ in 0..50 {
            let out = selected(select_upstreams(&ups, "/", None, &mut rng()));
            assert_eq!(out, vec![0]);
        }
    }

    #[test]
    fn probability_one_always_includes() {
        let ups = parse_upstreams("a=http://a:8080:probability=1.0").unwrap();
        let mut r = rng();
        for _ in 0..50 {
            let out = selected(select_upstreams(&ups, "/", None, &mut r));
            assert_eq!(out, vec![0]);
        }
    }

    #[test]
    fn probability_gates_statistically() {
        let ups = parse_upstreams("a=http://a:8080:probability=0.3").unwrap();
        let mut r = rng();
        let mut included = 0u32;
        const N: u32 = 2000;
        for _ in 0..N {
            if !selected(select_upstreams(&ups, "/", None, &mut r)).is_empty() {
                included += 1;
            }
        }
        let rate = f64::from(included) / f64::from(N);
        assert!((rate - 0.3).abs() < 0.05, "observed rate {rate}");
    }

    #[test]
    fn group_selects_exactly_one() {
        let ups = parse_upstreams(
            "a=http://a:8080:group=backend|b=http://b:8080:group=backend|c=http://c:8080",
        )
        .unwrap();
        let mut r = rng();
        for _ in 0..100 {
            let out = selected(select_upstreams(&ups, "/", None, &mut r));
            // c always included, plus exactly one of a/b.
            assert_eq!(out.len(), 2);
            assert!(out.contains(&2));
            assert!(out[0] == 0 || out[0] == 1);
        }
    }

    #[test]
    fn configured_weights_bias_selection() {
        let ups = parse_upstreams(
            "a=http://a:8080:group=g:weight=3|b=http://b:8080:group=g:weight=1",
        )
        .unwrap();
        let mut r = rng();
        let mut picks_a = 0u32;
        const N: u32 = 4000;
        for _ in 0..N {
            if selected(select_upstreams(&ups, "/", None, &mut r)) == vec![0] {
                picks_a += 1;
            }
        }
        let rate = f64::from(picks_a) / f64::from(N);
        assert!((rate - 0.75).abs() < 0.05, "observed a-rate {rate}");
    }

    #[test]
    fn request_weights_override_configured() {
        let ups = parse_upstreams(
            "a=http://a:8080:group=g:weight=100|b=http://b:8080:group=g:weight=0",
        )
        .unwrap();
        // Request flips the bias entirely onto b.
        let weights = BTreeMap::from([("a".to_string(), 0u32), ("b".to_string(), 100u32)]);
        let mut r = rng();
        for _ in 0..100 {
            let out = selected(select_upstreams(&ups, "/", Some(&weights), &mut r));
            assert_eq!(out, vec![1]);
        }
    }

    #[test]
    fn unweighted_members_share_the_remainder() {
        let ups = parse_upstreams(
            "a=http://a:8080:group=g:weight=80|b=http://b:8080:group=g|c=http://c:8080:group=g",
        )
        .unwrap();
        // a:80, b and c split the remaining 20 as 10 each.
        let mut r = rng();
        let mut counts = [0u32; 3];
        const N: u32 = 5000;
        for _ in 0..N {
            let out = selected(select_upstreams(&ups, "/", None, &mut r));
            counts[out[0]] += 1;
        }
        let rate_a = f64::from(counts[0]) / f64::from(N);
        let rate_b = f64::from(counts[1]) / f64::from(N);
        assert!((rate_a - 0.8).abs() < 0.05, "observed a-rate {rate_a}");
        assert!((rate_b - 0.1).abs() < 0.03, "observed b-rate {rate_b}");
    }

    #[test]
    fn all_zero_weights_fall_back_to_uniform() {
        let ups = parse_upstreams(
            "a=http://a:8080:group=g:weight=0|b=http://b:8080:group=g:weight=0",
        )
        .unwrap();
        let mut r = rng();
        let mut picks_a = 0u32;
        const N: u32 = 2000;
        for _ in 0..N {
            if selected(select_upstreams(&ups, "/", None, &mut r)) == vec![0] {
                picks_a += 1;
            }
        }
        let rate = f64::from(picks_a) / f64::from(N);
        assert!((rate - 0.5).abs() < 0.05, "observed a-rate {rate}");
    }

    #[test]
    fn duplicate_names_both_dispatch() {
        let ups = parse_upstreams(
            "a=http://a:8080:match=/x|a=http://a:8080:match=/x/y",
        )
        .unwrap();
        let out = selected(select_upstreams(&ups, "/x/y/z", None, &mut rng()));
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn selection_preserves_configuration_order() {
        let ups = parse_upstreams(
            "z=http://z:8080|g1=http://g:8080:group=g|a=http://a:8080",
        )
        .unwrap();
        let out = selected(select_upstreams(&ups, "/", None, &mut rng()));
        assert_eq!(out, vec![0, 1, 2]);
    }
}
