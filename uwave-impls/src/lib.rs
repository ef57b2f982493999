//! Concrete implementors of the üWave core seams that don't need an
//! external service: an in-process ephemeral store and a map-backed
//! database. The end-to-end scenarios run against these.

mod databases;
mod stores;

pub use databases::*;
pub use stores::*;

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use tokio::sync::broadcast::{self, error::TryRecvError};
    use uwave_core::{
        keys, topics, AdvanceOptions, BoothError, Database, EphemeralStore, FoundMedia,
        HistoryEntryData, Lease, MediaSnapshot, NewHistoryEntry, NewMedia, Pagination,
        PlaylistData, PlaylistError, PlaylistItemInput, PlaylistItemPatch, PlaylistItemRef,
        PrimaryKey, PublishedMessage, SourceAdapter, SourceError, SourceId, UserData, Uwave,
        VoteDirection, LOCK_TTL,
    };

    use crate::{MemoryDatabase, MemoryStore};

    type TestUwave = Uwave<MemoryStore, MemoryDatabase>;

    /// A source that knows every id it is asked about and records the
    /// batches it was asked for.
    #[derive(Default)]
    struct FakeSource {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl FakeSource {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeSource {
        fn source_type(&self) -> &'static str {
            "fake"
        }

        async fn get_one(&self, source_id: &str) -> Result<FoundMedia, SourceError> {
            let mut media = self.get(&[source_id.to_string()]).await?;
            media.pop().ok_or(SourceError::NotFound)
        }

        async fn get(&self, source_ids: &[String]) -> Result<Vec<FoundMedia>, SourceError> {
            self.batches.lock().push(source_ids.to_vec());

            Ok(source_ids
                .iter()
                .map(|source_id| FoundMedia {
                    source_id: source_id.clone(),
                    duration: 300,
                    artist: format!("artist of {source_id}"),
                    title: format!("title of {source_id}"),
                })
                .collect())
        }
    }

    fn room() -> (TestUwave, MemoryStore, MemoryDatabase) {
        let store = MemoryStore::new();
        let db = MemoryDatabase::new();
        let uwave = Uwave::new(
            store.clone(),
            db.clone(),
            vec![Arc::new(FakeSource::default())],
        );

        (uwave, store, db)
    }

    /// Creates a user with an active playlist of the given tracks.
    /// Track tuples are `(title, duration in seconds)`.
    async fn dj(
        uwave: &TestUwave,
        db: &MemoryDatabase,
        name: &str,
        tracks: &[(&str, i32)],
    ) -> (UserData, PlaylistData) {
        let user = db.add_user(name);

        let playlist = uwave
            .playlists
            .create_playlist(user.id, format!("{name}'s rotation"))
            .await
            .expect("playlist is created");

        if !tracks.is_empty() {
            let media = db
                .create_media(
                    tracks
                        .iter()
                        .map(|(title, duration)| NewMedia {
                            source_type: "fake".into(),
                            source_id: format!("{name}-{title}"),
                            duration: *duration,
                            artist: name.to_string(),
                            title: title.to_string(),
                        })
                        .collect(),
                )
                .await
                .expect("media is created");

            uwave
                .playlists
                .add_items(
                    playlist.id,
                    media.iter().map(|m| PlaylistItemRef::ById(m.id)).collect(),
                    None,
                )
                .await
                .expect("items are added");
        }

        uwave
            .playlists
            .activate_playlist(user.id, playlist.id)
            .await
            .expect("playlist is activated");

        let playlist = uwave.playlists.playlist(playlist.id).await.unwrap();
        (user, playlist)
    }

    fn entity(source_id: &str) -> PlaylistItemRef {
        PlaylistItemRef::ByEntity(PlaylistItemInput {
            source_type: "fake".into(),
            source_id: SourceId::Text(source_id.into()),
            artist: None,
            title: None,
            start: None,
            end: None,
        })
    }

    /// Polls until the booth moves past the given entry. Meant for paused
    /// time, where the sleeps are virtual.
    async fn wait_for_new_entry(uwave: &TestUwave, last_id: PrimaryKey) -> HistoryEntryData {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(500)).await;

            if let Some(entry) = uwave.booth.current_entry().await.unwrap() {
                if entry.id != last_id {
                    return entry;
                }
            }
        }

        panic!("booth did not advance in time");
    }

    fn drain(
        events: &mut broadcast::Receiver<PublishedMessage>,
    ) -> Vec<PublishedMessage> {
        let mut messages = vec![];

        loop {
            match events.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return messages,
                Err(e) => panic!("event stream broke: {e}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_dj_loop() {
        let (uwave, store, db) = room();
        let (user, _) = dj(&uwave, &db, "U", &[("A", 5), ("B", 5)]).await;

        uwave.booth.join_waitlist(user.id).await.unwrap();
        let mut events = store.subscribe_all();

        let first = uwave
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap()
            .expect("someone plays");

        assert_eq!(first.media.title, "A");
        assert_eq!(first.user_id, user.id);
        assert_eq!(
            uwave.booth.waitlist().await.unwrap(),
            Vec::<PrimaryKey>::new(),
            "a lone DJ is not queued"
        );

        // The timer keeps the loop going without further calls
        let second = wait_for_new_entry(&uwave, first.id).await;
        assert_eq!(second.media.title, "B");
        assert_eq!(second.user_id, user.id, "the lone DJ is reused");

        let third = wait_for_new_entry(&uwave, second.id).await;
        assert_eq!(third.media.title, "A", "the playlist cycles back around");

        let announced: Vec<i64> = drain(&mut events)
            .into_iter()
            .filter(|m| m.topic == topics::ADVANCE_COMPLETE)
            .map(|m| {
                serde_json::from_str::<serde_json::Value>(&m.payload).unwrap()["historyID"]
                    .as_i64()
                    .unwrap()
            })
            .collect();

        assert_eq!(
            announced,
            vec![first.id as i64, second.id as i64, third.id as i64],
            "every transition is announced with its new entry"
        );

        uwave.stop();
    }

    #[tokio::test]
    async fn test_two_dj_rotation_with_voting() {
        let (uwave, _store, db) = room();
        let (u1, _) = dj(&uwave, &db, "U1", &[("A", 30)]).await;
        let (u2, _) = dj(&uwave, &db, "U2", &[("B", 30)]).await;

        uwave.booth.join_waitlist(u1.id).await.unwrap();
        let first = uwave
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap()
            .unwrap();

        uwave.booth.join_waitlist(u2.id).await.unwrap();

        for voter in [11, 12, 13] {
            uwave.booth.cast_vote(voter, VoteDirection::Up).await.unwrap();
        }
        uwave.booth.cast_vote(14, VoteDirection::Down).await.unwrap();

        let second = uwave
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.user_id, u2.id);
        assert_eq!(second.media.title, "B");

        let sealed = db.history_by_id(first.id).await.unwrap();
        assert_eq!(sealed.upvotes.len(), 3);
        assert_eq!(sealed.downvotes.len(), 1);
        assert_eq!(sealed.favorites.len(), 0);

        assert_eq!(
            uwave.booth.waitlist().await.unwrap(),
            vec![u1.id],
            "the finished DJ goes to the back of the line"
        );

        let votes = uwave.booth.current_booth().await.unwrap().unwrap().votes;
        assert!(
            votes.upvotes.is_empty() && votes.downvotes.is_empty() && votes.favorites.is_empty(),
            "vote sets are empty right after a transition"
        );

        uwave.stop();
    }

    #[tokio::test]
    async fn test_empty_playlist_skip() {
        let (uwave, _store, db) = room();
        let (u1, _) = dj(&uwave, &db, "U1", &[("A", 30), ("A2", 30)]).await;
        let (u2, _) = dj(&uwave, &db, "U2", &[]).await;

        uwave.booth.join_waitlist(u1.id).await.unwrap();
        uwave.booth.advance(AdvanceOptions::default()).await.unwrap();

        uwave.booth.join_waitlist(u2.id).await.unwrap();
        let next = uwave
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap()
            .expect("the room keeps going");

        assert_eq!(next.user_id, u1.id, "the empty-playlist DJ is skipped");
        assert_eq!(next.media.title, "A2");
        assert_eq!(
            uwave.booth.waitlist().await.unwrap(),
            Vec::<PrimaryKey>::new(),
            "the skipped user is popped without being re-queued"
        );

        uwave.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovery_mid_play() {
        let (uwave, store, db) = room();
        let (user, playlist) = dj(&uwave, &db, "U", &[("A", 30), ("B", 30)]).await;
        let item = uwave.playlists.first_item(&playlist).await.unwrap();

        // State left behind by a previous instance, ten seconds in
        let entry = db
            .create_history_entry(NewHistoryEntry {
                user_id: user.id,
                playlist_id: playlist.id,
                item_id: item.id,
                media: MediaSnapshot {
                    media_id: item.media.id,
                    artist: item.artist.clone(),
                    title: item.title.clone(),
                    start: 0,
                    end: 30,
                },
            })
            .await
            .unwrap();
        db.set_played_at(entry.id, Utc::now() - chrono::Duration::seconds(10));
        store
            .set(keys::HISTORY_ID, &entry.id.to_string())
            .await
            .unwrap();
        store
            .set(keys::CURRENT_DJ, &user.id.to_string())
            .await
            .unwrap();
        // The instance that started this play also cycled the playlist
        uwave.playlists.cycle(playlist.id).await.unwrap();

        uwave.start().await.unwrap();
        assert!(uwave.booth.timer_armed(), "a timer covers the remainder");

        tokio::time::sleep(Duration::from_secs(15)).await;
        let current = uwave.booth.current_entry().await.unwrap().unwrap();
        assert_eq!(current.id, entry.id, "the track plays out its remainder");

        let next = wait_for_new_entry(&uwave, entry.id).await;
        assert_eq!(next.media.title, "B");

        uwave.stop();
    }

    #[tokio::test]
    async fn test_restart_recovery_after_track_ended() {
        let (uwave, store, db) = room();
        let (user, playlist) = dj(&uwave, &db, "U", &[("A", 30)]).await;
        let item = uwave.playlists.first_item(&playlist).await.unwrap();

        let entry = db
            .create_history_entry(NewHistoryEntry {
                user_id: user.id,
                playlist_id: playlist.id,
                item_id: item.id,
                media: MediaSnapshot {
                    media_id: item.media.id,
                    artist: item.artist.clone(),
                    title: item.title.clone(),
                    start: 0,
                    end: 30,
                },
            })
            .await
            .unwrap();
        db.set_played_at(entry.id, Utc::now() - chrono::Duration::seconds(40));
        store
            .set(keys::HISTORY_ID, &entry.id.to_string())
            .await
            .unwrap();
        store
            .set(keys::CURRENT_DJ, &user.id.to_string())
            .await
            .unwrap();

        uwave.start().await.unwrap();

        let current = uwave.booth.current_entry().await.unwrap().unwrap();
        assert_ne!(current.id, entry.id, "an overdue track advances right away");

        uwave.stop();
    }

    #[tokio::test]
    async fn test_concurrent_advance() {
        let (uwave_a, store, db) = room();
        let uwave_b = Uwave::new(store.clone(), db.clone(), vec![]);

        let (user, _) = dj(&uwave_a, &db, "U", &[("A", 30)]).await;
        uwave_a.booth.join_waitlist(user.id).await.unwrap();

        let mut events = store.subscribe_all();

        // Instance A is mid-advance; B's timer fires at the same moment
        let lease = Lease::acquire(uwave_a.store(), keys::ADVANCE_LOCK, LOCK_TTL)
            .await
            .expect("locks successfully");

        let error = uwave_b
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, BoothError::AdvanceInProgress));
        assert_eq!(
            store.get(keys::HISTORY_ID).await.unwrap(),
            None,
            "the losing instance does not mutate state"
        );
        assert_eq!(uwave_b.booth.waitlist().await.unwrap(), vec![user.id]);

        lease.release().await;
        uwave_a
            .booth
            .advance(AdvanceOptions::default())
            .await
            .unwrap()
            .expect("the winner advances");

        let announcements = drain(&mut events)
            .into_iter()
            .filter(|m| m.topic == topics::ADVANCE_COMPLETE)
            .count();
        assert_eq!(announcements, 1, "exactly one advance is announced");

        uwave_a.stop();
    }

    #[tokio::test]
    async fn test_replace_dj() {
        let (uwave, store, db) = room();
        let (u1, _) = dj(&uwave, &db, "U1", &[("A", 30)]).await;
        let (u2, _) = dj(&uwave, &db, "U2", &[("B", 30)]).await;
        let (u3, _) = dj(&uwave, &db, "U3", &[("C", 30)]).await;

        uwave.booth.join_waitlist(u1.id).await.unwrap();
        uwave.booth.advance(AdvanceOptions::default()).await.unwrap();
        uwave.booth.join_waitlist(u2.id).await.unwrap();
        uwave.booth.join_waitlist(u3.id).await.unwrap();

        let next = uwave
            .booth
            .advance(AdvanceOptions::removal())
            .await
            .unwrap()
            .expect("the waitlist head takes over");
        assert_eq!(next.user_id, u2.id);
        assert_eq!(
            uwave.booth.waitlist().await.unwrap(),
            vec![u3.id],
            "the removed DJ is not re-queued"
        );

        // Removing with nobody left empties the booth
        uwave.booth.advance(AdvanceOptions::removal()).await.unwrap();
        let idle = uwave.booth.advance(AdvanceOptions::removal()).await.unwrap();

        assert_eq!(idle, None);
        assert_eq!(store.get(keys::HISTORY_ID).await.unwrap(), None);
        assert_eq!(store.get(keys::CURRENT_DJ).await.unwrap(), None);
        assert!(uwave.booth.current_booth().await.unwrap().is_none());

        uwave.stop();
    }

    #[tokio::test]
    async fn test_publish_order() {
        let (uwave, store, db) = room();
        let (user, _) = dj(&uwave, &db, "U", &[("A", 30)]).await;

        uwave.booth.join_waitlist(user.id).await.unwrap();
        let mut events = store.subscribe_all();

        uwave.booth.advance(AdvanceOptions::default()).await.unwrap();

        let order: Vec<String> = drain(&mut events)
            .into_iter()
            .map(|m| m.topic)
            .collect();

        assert_eq!(
            order,
            vec![
                topics::ADVANCE_COMPLETE,
                topics::PLAYLIST_CYCLE,
                topics::USER_PLAY,
                topics::WAITLIST_UPDATE,
            ],
            "publishes keep their fixed order"
        );

        uwave.stop();
    }

    #[tokio::test]
    async fn test_vote_switching_and_favorites() {
        let (uwave, _store, db) = room();
        let (user, _) = dj(&uwave, &db, "U", &[("A", 30)]).await;

        let error = uwave
            .booth
            .cast_vote(9, VoteDirection::Up)
            .await
            .unwrap_err();
        assert!(
            matches!(error, BoothError::NothingPlaying),
            "votes need a current play"
        );

        uwave.booth.join_waitlist(user.id).await.unwrap();
        uwave.booth.advance(AdvanceOptions::default()).await.unwrap();

        uwave.booth.cast_vote(9, VoteDirection::Up).await.unwrap();
        uwave.booth.cast_vote(9, VoteDirection::Down).await.unwrap();

        let votes = uwave.booth.current_booth().await.unwrap().unwrap().votes;
        assert_eq!(votes.upvotes, Vec::<PrimaryKey>::new(), "switching sides removes the old vote");
        assert_eq!(votes.downvotes, vec![9]);

        assert!(uwave.booth.toggle_favorite(9).await.unwrap());
        assert!(!uwave.booth.toggle_favorite(9).await.unwrap());

        let votes = uwave.booth.current_booth().await.unwrap().unwrap().votes;
        assert_eq!(votes.downvotes, vec![9], "favorites are independent");
        assert_eq!(votes.favorites, Vec::<PrimaryKey>::new());

        uwave.stop();
    }

    #[tokio::test]
    async fn test_waitlist_rules() {
        let (uwave, _store, db) = room();
        let (u1, _) = dj(&uwave, &db, "U1", &[("A", 30)]).await;
        let u2 = db.add_user("U2");

        uwave.booth.join_waitlist(u1.id).await.unwrap();
        let error = uwave.booth.join_waitlist(u1.id).await.unwrap_err();
        assert!(matches!(error, BoothError::AlreadyInWaitlist));

        uwave.booth.advance(AdvanceOptions::default()).await.unwrap();
        let error = uwave.booth.join_waitlist(u1.id).await.unwrap_err();
        assert!(
            matches!(error, BoothError::AlreadyPlaying),
            "the current DJ stays out of the waitlist"
        );

        uwave.booth.join_waitlist(u2.id).await.unwrap();
        uwave.booth.leave_waitlist(u2.id).await.unwrap();
        let error = uwave.booth.leave_waitlist(u2.id).await.unwrap_err();
        assert!(matches!(error, BoothError::NotInWaitlist));

        uwave.stop();
    }

    #[tokio::test]
    async fn test_add_then_remove_round_trip() {
        let (uwave, _store, db) = room();
        let (_, playlist) = dj(&uwave, &db, "R", &[("x", 10), ("y", 10)]).await;
        let before = playlist.item_ids.clone();

        let added = uwave
            .playlists
            .add_items(
                playlist.id,
                vec![entity("a1"), entity("a2")],
                Some(before[0]),
            )
            .await
            .unwrap();

        assert_eq!(added.playlist_size, 4);
        assert_eq!(added.after_id, Some(before[0]));

        let order = uwave.playlists.playlist(playlist.id).await.unwrap().item_ids;
        assert_eq!(
            order,
            vec![before[0], added.added[0].id, added.added[1].id, before[1]],
            "new items sit contiguously after the anchor"
        );

        let added_ids: Vec<_> = added.added.iter().map(|item| item.id).collect();
        uwave
            .playlists
            .remove_items(playlist.id, &added_ids)
            .await
            .unwrap();

        let order = uwave.playlists.playlist(playlist.id).await.unwrap().item_ids;
        assert_eq!(order, before, "the playlist is back to its prior list");

        let error = uwave.playlists.item(added_ids[0]).await.unwrap_err();
        assert!(
            matches!(error, PlaylistError::ItemNotFound(_)),
            "removed item records are deleted"
        );
    }

    #[tokio::test]
    async fn test_move_items_is_idempotent() {
        let (uwave, _store, db) = room();
        let (_, playlist) =
            dj(&uwave, &db, "M", &[("one", 10), ("two", 10), ("three", 10), ("four", 10)]).await;
        let ids = playlist.item_ids.clone();

        uwave
            .playlists
            .move_items(playlist.id, vec![ids[1]], Some(ids[2]))
            .await
            .unwrap();
        let once = uwave.playlists.playlist(playlist.id).await.unwrap().item_ids;
        assert_eq!(once, vec![ids[0], ids[2], ids[1], ids[3]]);

        uwave
            .playlists
            .move_items(playlist.id, vec![ids[1]], Some(ids[2]))
            .await
            .unwrap();
        let twice = uwave.playlists.playlist(playlist.id).await.unwrap().item_ids;
        assert_eq!(twice, once, "moving again does nothing new");
    }

    #[tokio::test]
    async fn test_shuffle_preserves_items() {
        let (uwave, _store, db) = room();
        let (_, playlist) = dj(
            &uwave,
            &db,
            "S",
            &[("a", 10), ("b", 10), ("c", 10), ("d", 10), ("e", 10)],
        )
        .await;

        let mut before = playlist.item_ids.clone();
        let shuffled = uwave.playlists.shuffle_playlist(playlist.id).await.unwrap();
        let mut after = shuffled.item_ids;

        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after, "shuffling keeps the same items");
    }

    #[tokio::test]
    async fn test_filter_and_pagination() {
        let (uwave, _store, db) = room();
        let (_, playlist) = dj(
            &uwave,
            &db,
            "F",
            &[("Alpha", 10), ("beta", 10), ("ALPHA remix", 10)],
        )
        .await;

        let page = uwave
            .playlists
            .items(
                playlist.id,
                Some("alpha"),
                Pagination {
                    offset: 0,
                    limit: 1,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.filtered, Some(2), "the filter is case-insensitive");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "Alpha", "matches keep their order");
        assert_eq!(page.next_offset(), Some(1));
        assert_eq!(page.previous_offset(), None);
    }

    #[tokio::test]
    async fn test_update_item_reclamps_range() {
        let (uwave, _store, db) = room();
        let (_, playlist) = dj(&uwave, &db, "C", &[("long", 300)]).await;
        let item_id = playlist.item_ids[0];

        let item = uwave
            .playlists
            .update_item(
                item_id,
                PlaylistItemPatch {
                    start: Some(-5),
                    end: Some(9000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!((item.start, item.end), (0, 300));

        let item = uwave
            .playlists
            .update_item(
                item_id,
                PlaylistItemPatch {
                    start: Some(200),
                    end: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!((item.start, item.end), (200, 200), "end never precedes start");
    }

    #[tokio::test]
    async fn test_add_items_resolves_each_source_once() {
        let store = MemoryStore::new();
        let db = MemoryDatabase::new();
        let source = Arc::new(FakeSource::default());
        let uwave = Uwave::new(store.clone(), db.clone(), vec![source.clone() as _]);

        let user = db.add_user("S");
        let playlist = uwave
            .playlists
            .create_playlist(user.id, "imports".into())
            .await
            .unwrap();

        let added = uwave
            .playlists
            .add_items(
                playlist.id,
                vec![entity("dup"), entity("dup"), entity("fresh")],
                None,
            )
            .await
            .unwrap();

        assert_eq!(added.added.len(), 3);
        assert_eq!(
            source.batches(),
            vec![vec!["dup".to_string(), "fresh".to_string()]],
            "unknown ids go to the source once, in one batch"
        );
        assert_eq!(
            added.added[0].media.id, added.added[1].media.id,
            "duplicate inputs share one media record"
        );

        uwave
            .playlists
            .add_items(playlist.id, vec![entity("dup")], None)
            .await
            .unwrap();
        assert_eq!(
            source.batches().len(),
            1,
            "known media is served from the database"
        );
    }

    #[tokio::test]
    async fn test_add_items_validates_input() {
        let (uwave, _store, db) = room();
        let (_, playlist) = dj(&uwave, &db, "V", &[]).await;

        let invalid = PlaylistItemRef::ByEntity(PlaylistItemInput {
            source_type: "".into(),
            source_id: SourceId::Text("x".into()),
            artist: None,
            title: None,
            start: None,
            end: None,
        });

        let error = uwave
            .playlists
            .add_items(playlist.id, vec![invalid], None)
            .await
            .unwrap_err();
        assert!(matches!(error, PlaylistError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_user_playlist_ownership() {
        let (uwave, _store, db) = room();
        let (_, playlist) = dj(&uwave, &db, "Owner", &[("a", 10)]).await;
        let other = db.add_user("Other");

        let error = uwave
            .playlists
            .user_playlist(other.id, playlist.id)
            .await
            .unwrap_err();
        assert!(
            matches!(error, PlaylistError::PlaylistNotFound(_)),
            "someone else's playlist reads as missing"
        );
    }
}
