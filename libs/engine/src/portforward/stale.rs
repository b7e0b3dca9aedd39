use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

use super::StalePolicy;
use crate::error::Result;
use crate::labels::{ApplicationSelector, REVISION_ANNOTATION};

/// The replica sets of an application whose revision no longer matches their
/// deployment's desired revision. Their pods are being scaled down and must
/// not receive port-forwards.
///
/// Once built the set is read-only; it is consulted on every pod event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaleReplicaSets {
    names: HashSet<String>,
}

impl StaleReplicaSets {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Whether the pod is controlled by one of the outdated replica sets.
    pub fn is_stale_owner(&self, pod: &Pod) -> bool {
        pod.owner_references()
            .iter()
            .any(|owner| owner.kind == "ReplicaSet" && self.names.contains(&owner.name))
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<String> for StaleReplicaSets {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// Lists the application's deployments and replica sets and keeps every
/// replica set whose revision annotation differs from its deployment's.
pub async fn find_stale_replica_sets(
    client: &Client,
    namespace: &str,
    selector: &ApplicationSelector,
) -> Result<StaleReplicaSets> {
    let params = ListParams::default().labels(&selector.to_label_selector());
    let deployments = Api::<Deployment>::namespaced(client.clone(), namespace)
        .list(&params)
        .await?;
    let replica_sets = Api::<ReplicaSet>::namespaced(client.clone(), namespace)
        .list(&params)
        .await?;
    Ok(compute_stale(&deployments.items, &replica_sets.items))
}

fn compute_stale(deployments: &[Deployment], replica_sets: &[ReplicaSet]) -> StaleReplicaSets {
    let desired: HashMap<&str, &str> = deployments
        .iter()
        .filter_map(|deployment| {
            let name = deployment.metadata.name.as_deref()?;
            let revision = deployment
                .annotations()
                .get(REVISION_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default();
            Some((name, revision))
        })
        .collect();

    let mut groups: HashMap<&str, Vec<&ReplicaSet>> = HashMap::new();
    for replica_set in replica_sets {
        // replica sets without a deployment owner are not ours to judge
        let Some(owner) = replica_set
            .owner_references()
            .iter()
            .find(|owner| owner.kind == "Deployment")
        else {
            continue;
        };
        if desired.contains_key(owner.name.as_str()) {
            groups
                .entry(owner.name.as_str())
                .or_default()
                .push(replica_set);
        }
    }

    groups
        .into_iter()
        // a deployment with a single replica set has nothing outdated
        .filter(|(_, group)| group.len() > 1)
        .flat_map(|(owner, group)| {
            let desired_revision = desired.get(owner).copied().unwrap_or_default();
            group.into_iter().filter_map(move |replica_set| {
                let revision = replica_set
                    .annotations()
                    .get(REVISION_ANNOTATION)
                    .map(String::as_str)
                    .unwrap_or_default();
                if revision != desired_revision {
                    replica_set.metadata.name.clone()
                } else {
                    None
                }
            })
        })
        .collect()
}

/// Resolves the stale set a deployment watcher consults per pod event,
/// according to the configured [`StalePolicy`].
#[derive(Clone)]
pub(crate) struct StaleTracker {
    policy: StalePolicy,
    snapshot: Arc<StaleReplicaSets>,
    client: Client,
    namespace: String,
    selector: ApplicationSelector,
}

impl StaleTracker {
    pub(crate) fn new(
        policy: StalePolicy,
        snapshot: Arc<StaleReplicaSets>,
        client: Client,
        namespace: String,
        selector: ApplicationSelector,
    ) -> Self {
        Self {
            policy,
            snapshot,
            client,
            namespace,
            selector,
        }
    }

    pub(crate) async fn current(&self) -> Result<Arc<StaleReplicaSets>> {
        match self.policy {
            StalePolicy::Snapshot => Ok(self.snapshot.clone()),
            StalePolicy::Live => {
                find_stale_replica_sets(&self.client, &self.namespace, &self.selector)
                    .await
                    .map(Arc::new)
            }
        }
    }
}
