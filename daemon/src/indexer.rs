use crate::db::Mutation;
use crate::index::{IndexItem, ScribeMsg};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::errors::*;

/// Watches the committed-mutation feed and turns each mutation into the
/// index rewrites it implies. The writer's own coalescing makes it cheap to
/// be generous here.
pub fn spawn(
    mut mutations: mpsc::UnboundedReceiver<Mutation>,
    scribe: mpsc::Sender<ScribeMsg>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mutation = tokio::select! {
                _ = shutdown.cancelled() => break,
                mutation = mutations.recv() => match mutation {
                    Some(mutation) => mutation,
                    None => break,
                },
            };
            for item in items_for(&mutation) {
                if scribe.send(ScribeMsg::Item(item)).await.is_err() {
                    return;
                }
            }
        }
        debug!("indexer exited");
    })
}

fn items_for(mutation: &Mutation) -> Vec<IndexItem> {
    match mutation {
        Mutation::PackageAdded { package } | Mutation::VersionAdded { package } => {
            vec![IndexItem::RewriteProject(package.clone())]
        }
        Mutation::PackageSkipped { package } | Mutation::VersionSkipped { package } => {
            // Skipping can change root membership; the writer's body-hash
            // check suppresses the no-op case.
            vec![
                IndexItem::RewriteProject(package.clone()),
                IndexItem::RewriteRoot,
            ]
        }
        Mutation::BuildLogged { package } => {
            vec![IndexItem::Rewrite(package.clone()), IndexItem::RewriteRoot]
        }
        Mutation::BuildDeleted { package, .. } => {
            vec![IndexItem::Rewrite(package.clone()), IndexItem::RewriteRoot]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_mutations_rewrite_package_and_root() {
        let items = items_for(&Mutation::BuildLogged {
            package: "foo".to_string(),
        });
        assert!(items.contains(&IndexItem::Rewrite("foo".to_string())));
        assert!(items.contains(&IndexItem::RewriteRoot));
    }

    #[test]
    fn new_versions_only_touch_the_project_page() {
        let items = items_for(&Mutation::VersionAdded {
            package: "foo".to_string(),
        });
        assert_eq!(items, vec![IndexItem::RewriteProject("foo".to_string())]);
    }
}
