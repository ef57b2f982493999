mod booth;
mod db;
mod events;
mod playlists;
mod sources;
mod store;

use std::sync::Arc;

pub use booth::*;
pub use db::*;
pub use events::*;
pub use playlists::*;
pub use sources::*;
pub use store::*;

/// The üWave booth core, facilitating playlist management and booth
/// advancement across any number of server instances.
pub struct Uwave<S, Db> {
    store: Arc<S>,
    database: Arc<Db>,

    pub playlists: Arc<Playlists<Db>>,
    pub booth: Booth<S, Db>,
}

impl<S, Db> Uwave<S, Db>
where
    S: EphemeralStore + 'static,
    Db: Database + 'static,
{
    pub fn new(store: S, database: Db, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        let store = Arc::new(store);
        let database = Arc::new(database);

        let mut resolver = SourceResolver::new(&database);
        for adapter in adapters {
            resolver.register(adapter);
        }

        let playlists = Arc::new(Playlists::new(&database, resolver));
        let booth = Booth::new(&store, &database, &playlists);

        Self {
            store,
            database,
            playlists,
            booth,
        }
    }

    /// Resumes a play that was in progress before a restart
    pub async fn start(&self) -> std::result::Result<(), BoothError> {
        self.booth.recover().await
    }

    /// Stops the pending timer. Shared state is left for the next instance.
    pub fn stop(&self) {
        self.booth.shutdown();
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn database(&self) -> &Arc<Db> {
        &self.database
    }
}
