//! Adduct type assignment over aligned rows.
//!
//! Rows are nodes; two rows are linked when a member ion of one was found as a correlated
//! adduct partner of a member of the other in the same sample. Every edge carries the type
//! pairs that explain the link plus a "no relation" option. A Gibbs sampler resamples one
//! edge at a time given the types its neighbouring edges currently imply, and the types
//! each node carries are tallied after burn-in.
use std::collections::{BTreeMap, HashMap};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::align::AlignedFeatures;
use crate::ion_type::IonType;
use crate::params::NetworkParams;
use crate::scan::Polarity;
use crate::trace::{Segment, TraceKey};

/// The ion types retained for a row, most probable first
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdductAssignment {
    pub probabilities: Vec<(IonType, f64)>,
    pub detected: Option<IonType>,
}

impl AdductAssignment {
    pub fn possible(&self) -> impl Iterator<Item = &IonType> + '_ {
        self.probabilities.iter().map(|(t, _)| t)
    }

    pub fn best(&self) -> Option<&IonType> {
        self.probabilities.first().map(|(t, _)| t)
    }

    pub fn is_ionization_unknown(&self) -> bool {
        self.detected.is_none()
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    /// The type of the edge's first node
    left: IonType,
    /// The type of the edge's second node
    right: IonType,
    weight: f64,
}

#[derive(Debug, Clone)]
struct Edge {
    left: usize,
    right: usize,
    hypotheses: Vec<Hypothesis>,
}

impl Edge {
    fn type_at(&self, node: usize, state: usize) -> Option<&IonType> {
        let h = self.hypotheses.get(state.checked_sub(1)?)?;
        if node == self.left {
            Some(&h.left)
        } else {
            Some(&h.right)
        }
    }
}

#[derive(Debug, Clone)]
pub struct IonNetwork {
    polarities: Vec<Polarity>,
    edges: Vec<Edge>,
    incident: Vec<Vec<usize>>,
}

impl IonNetwork {
    /// Link rows through the adduct partners of their members
    pub fn from_rows(rows: &[AlignedFeatures], params: &NetworkParams) -> Self {
        let mut lookup: HashMap<(usize, TraceKey), Vec<(usize, Segment)>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            for (sample, member) in row.members() {
                lookup
                    .entry((*sample, member.ion.trace.key()))
                    .or_default()
                    .push((i, member.ion.segment));
            }
        }

        let mut support: BTreeMap<(usize, usize), BTreeMap<(IonType, IonType), usize>> =
            BTreeMap::new();
        for (i, row) in rows.iter().enumerate() {
            for (sample, member) in row.members() {
                for adduct in member.ion.adducts.iter() {
                    let Some(targets) = lookup.get(&(*sample, adduct.partner.trace.key())) else {
                        continue;
                    };
                    for (j, segment) in targets {
                        if *j == i || !segment.overlaps(&adduct.partner.segment) {
                            continue;
                        }
                        let (key, pair) = if i < *j {
                            ((i, *j), (adduct.ion_type.clone(), adduct.partner_type.clone()))
                        } else {
                            ((*j, i), (adduct.partner_type.clone(), adduct.ion_type.clone()))
                        };
                        *support.entry(key).or_default().entry(pair).or_default() += 1;
                    }
                }
            }
        }

        let prior = |t: &IonType| {
            if t.is_common() {
                params.common_type_prior
            } else {
                1.0
            }
        };
        let mut incident = vec![Vec::new(); rows.len()];
        let edges: Vec<Edge> = support
            .into_iter()
            .enumerate()
            .map(|(e, ((left, right), pairs))| {
                incident[left].push(e);
                incident[right].push(e);
                let hypotheses = pairs
                    .into_iter()
                    .map(|((a, b), count)| Hypothesis {
                        weight: count as f64 * prior(&a) * prior(&b),
                        left: a,
                        right: b,
                    })
                    .collect();
                Edge {
                    left,
                    right,
                    hypotheses,
                }
            })
            .collect();
        Self {
            polarities: rows.iter().map(|r| r.polarity()).collect(),
            edges,
            incident,
        }
    }

    pub fn node_count(&self) -> usize {
        self.polarities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// The weight of `option` for `edge` given the other edges' current states
    fn conditional_weight(&self, edge: usize, option: usize, state: &[usize], params: &NetworkParams) -> f64 {
        if option == 0 {
            return params.unrelated_prior;
        }
        let e = &self.edges[edge];
        let mut weight = e.hypotheses[option - 1].weight;
        for node in [e.left, e.right] {
            let Some(proposed) = e.type_at(node, option) else {
                continue;
            };
            for f in self.incident[node].iter().copied().filter(|f| *f != edge) {
                if let Some(current) = self.edges[f].type_at(node, state[f]) {
                    if current != proposed {
                        weight *= params.inconsistency_penalty;
                    }
                }
            }
        }
        weight
    }

    /// The distinct types the related incident edges currently give `node`
    fn node_types(&self, node: usize, state: &[usize]) -> Vec<&IonType> {
        let mut types: Vec<&IonType> = self.incident[node]
            .iter()
            .filter_map(|e| self.edges[*e].type_at(node, state[*e]))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Run the sampler and summarise each linked node. Unlinked nodes get `None`.
    pub fn sample(&self, params: &NetworkParams) -> Vec<Option<AdductAssignment>> {
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let mut state = vec![0usize; self.edges.len()];
        let mut mass: Vec<BTreeMap<IonType, f64>> = vec![BTreeMap::new(); self.node_count()];
        let mut weights = Vec::new();
        let rounds = params.burn_in + params.iterations;
        for round in 0..rounds {
            for edge in 0..self.edges.len() {
                weights.clear();
                weights.extend(
                    (0..=self.edges[edge].hypotheses.len())
                        .map(|option| self.conditional_weight(edge, option, &state, params)),
                );
                let total: f64 = weights.iter().sum();
                let mut x = rng.gen::<f64>() * total;
                let mut chosen = weights.len() - 1;
                for (option, w) in weights.iter().enumerate() {
                    if x < *w {
                        chosen = option;
                        break;
                    }
                    x -= w;
                }
                state[edge] = chosen;
            }
            if round < params.burn_in {
                continue;
            }
            for (node, tally) in mass.iter_mut().enumerate() {
                if self.incident[node].is_empty() {
                    continue;
                }
                let types = self.node_types(node, &state);
                if types.is_empty() {
                    *tally
                        .entry(IonType::unknown(self.polarities[node]))
                        .or_default() += 1.0;
                } else {
                    let share = 1.0 / types.len() as f64;
                    for t in types {
                        *tally.entry(t.clone()).or_default() += share;
                    }
                }
            }
        }

        let iterations = params.iterations.max(1) as f64;
        mass.into_iter()
            .map(|tally| {
                if tally.is_empty() {
                    return None;
                }
                let mut probabilities: Vec<(IonType, f64)> = tally
                    .into_iter()
                    .map(|(t, m)| (t, m / iterations))
                    .collect();
                probabilities.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                let best = probabilities[0].1;
                probabilities.retain(|(_, p)| *p >= best * params.retain_fraction);
                let detected = match probabilities.as_slice() {
                    [(t, _)] if !t.is_unknown() => Some(t.clone()),
                    _ => None,
                };
                Some(AdductAssignment {
                    probabilities,
                    detected,
                })
            })
            .collect()
    }
}

/// Build the network over `rows`, sample it and attach the assignments.
///
/// Returns the number of rows that received one.
pub fn assign_ion_types(rows: &mut [AlignedFeatures], params: &NetworkParams) -> usize {
    let network = IonNetwork::from_rows(rows, params);
    debug!(
        "Adduct network of {} rows with {} edges",
        network.node_count(),
        network.edge_count()
    );
    let assignments = network.sample(params);
    let mut assigned = 0;
    for (row, assignment) in rows.iter_mut().zip(assignments) {
        if assignment.is_some() {
            assigned += 1;
        }
        row.ion_types = assignment;
    }
    assigned
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::ion::{AdductPartner, CorrelatedTrace, FragmentedIon};
    use crate::scan::ScanPoint;
    use crate::trace::Trace;

    fn make_ion(mz: f64) -> FragmentedIon {
        let points = [10.0f32, 60.0, 100.0, 50.0, 5.0]
            .iter()
            .enumerate()
            .map(|(i, v)| ScanPoint::new(i, i as i64 * 1000, mz, *v))
            .collect();
        let mut trace = Trace::from_points(TraceKey::new(2, mz), points).unwrap();
        let segment = trace.add_segment(0, 2, 4).unwrap();
        FragmentedIon::new(Arc::new(trace), segment, Polarity::Positive)
    }

    fn linked_rows() -> Vec<AlignedFeatures> {
        let protonated = make_ion(301.1);
        let sodiated = make_ion(323.09);
        let mut with_partner = protonated.clone();
        with_partner.adducts.push(AdductPartner {
            ion_type: "[M+H]+".parse().unwrap(),
            partner_type: "[M+Na]+".parse().unwrap(),
            partner: CorrelatedTrace {
                trace: sodiated.trace.clone(),
                segment: sodiated.segment,
                coefficient: 0.99,
                overlap: 5,
            },
            isotopes: Vec::new(),
        });
        vec![
            AlignedFeatures::new(0, Arc::new(with_partner), 2000.0),
            AlignedFeatures::new(0, Arc::new(sodiated), 2000.0),
            AlignedFeatures::new(0, Arc::new(make_ion(500.0)), 2000.0),
        ]
    }

    #[test]
    fn test_assign_linked_pair() {
        let mut rows = linked_rows();
        let params = NetworkParams::default();
        let network = IonNetwork::from_rows(&rows, &params);
        assert_eq!(network.edge_count(), 1);
        assert_eq!(assign_ion_types(&mut rows, &params), 2);
        let first = rows[0].ion_types.as_ref().unwrap();
        assert_eq!(first.detected.as_ref().map(|t| t.name()), Some("[M+H]+"));
        let second = rows[1].ion_types.as_ref().unwrap();
        assert_eq!(second.detected.as_ref().map(|t| t.name()), Some("[M+Na]+"));
        assert!(rows[2].ion_types.is_none());
    }

    #[test]
    fn test_best_type_retained() {
        let rows = linked_rows();
        let params = NetworkParams {
            unrelated_prior: 1.0,
            common_type_prior: 1.0,
            ..Default::default()
        };
        let network = IonNetwork::from_rows(&rows, &params);
        let first = network.sample(&params);
        let second = network.sample(&params);
        assert_eq!(first, second);
        for assignment in first.into_iter().flatten() {
            let best = assignment.probabilities[0].1;
            assert!(assignment.probabilities.iter().all(|(_, p)| *p <= best));
            assert!(assignment.best().is_some());
        }
    }
}
