//! Chapter state machine
//!
//! Each chapter carries two independent status axes (download, translation).
//! Every change goes through [`ChapterState::apply`], which either moves the
//! pair to a valid successor or rejects the event and leaves it untouched.
//!
//! While translation is `LOADING` the engine reads the chapter's pages, so
//! the download axis is pinned to `READY` until the translation settles.

use crate::models::{ChapterRef, Status, StatusField};
use thiserror::Error;

/// Events that drive a chapter's status pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterEvent {
    /// The worker picked the chapter up for download.
    DownloadStarted,
    DownloadSucceeded,
    DownloadFailed,
    /// The pipeline accepted the chapter.
    TranslationAccepted,
    TranslationCompleted,
    /// The pipeline produced nothing for the chapter.
    TranslationSkipped,
    TranslationFailed,
    RemoveRequested(StatusField),
    RemoveFinished(StatusField),
    /// Force an axis back to `NOT_READY`.
    Reset(StatusField),
}

impl ChapterEvent {
    /// Axis this event acts on.
    pub fn field(&self) -> StatusField {
        match self {
            ChapterEvent::DownloadStarted
            | ChapterEvent::DownloadSucceeded
            | ChapterEvent::DownloadFailed => StatusField::Download,
            ChapterEvent::TranslationAccepted
            | ChapterEvent::TranslationCompleted
            | ChapterEvent::TranslationSkipped
            | ChapterEvent::TranslationFailed => StatusField::Translation,
            ChapterEvent::RemoveRequested(field)
            | ChapterEvent::RemoveFinished(field)
            | ChapterEvent::Reset(field) => *field,
        }
    }
}

/// Error type for rejected transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The event is not valid from the axis' current status
    #[error("{event:?} is not allowed while {field} is {from}")]
    Invalid {
        event: ChapterEvent,
        field: StatusField,
        from: Status,
    },

    /// Translation requested before the pages are local
    #[error("translation needs download_status READY, found {download}")]
    DownloadNotReady { download: Status },

    /// The pages are in use by a running translation
    #[error("{event:?} is not allowed while the chapter is being translated")]
    TranslationInFlight { event: ChapterEvent },
}

/// Status pair of one chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChapterState {
    pub download: Status,
    pub translation: Status,
}

impl ChapterState {
    pub fn new(download: Status, translation: Status) -> Self {
        Self {
            download,
            translation,
        }
    }

    pub fn get(&self, field: StatusField) -> Status {
        match field {
            StatusField::Download => self.download,
            StatusField::Translation => self.translation,
        }
    }

    fn slot(&mut self, field: StatusField) -> &mut Status {
        match field {
            StatusField::Download => &mut self.download,
            StatusField::Translation => &mut self.translation,
        }
    }

    /// Healthy terminal state.
    pub fn is_complete(&self) -> bool {
        self.download == Status::Ready && self.translation == Status::Ready
    }

    /// Apply `event`. On error the state is unchanged.
    pub fn apply(&mut self, event: ChapterEvent) -> Result<(), TransitionError> {
        let field = event.field();
        let from = self.get(field);
        let next = next_status(self, event, from)?;
        *self.slot(field) = next;
        Ok(())
    }
}

fn next_status(
    state: &ChapterState,
    event: ChapterEvent,
    from: Status,
) -> Result<Status, TransitionError> {
    use ChapterEvent::*;
    use Status::*;

    if state.translation == Loading && event.field() == StatusField::Download {
        return Err(TransitionError::TranslationInFlight { event });
    }

    let to = match (event, from) {
        (DownloadStarted, NotReady | Ready) => Loading,
        (DownloadSucceeded, Loading) => Ready,
        (DownloadFailed, Loading) => NotReady,
        (TranslationAccepted, NotReady | Ready) => {
            if state.download != Ready {
                return Err(TransitionError::DownloadNotReady {
                    download: state.download,
                });
            }
            Loading
        }
        (TranslationCompleted, Loading) => Ready,
        (TranslationSkipped, NotReady | Loading) => NotReady,
        (TranslationFailed, Loading) => NotReady,
        (RemoveRequested(_), Ready) => Removing,
        (RemoveFinished(_), Removing) => NotReady,
        (Reset(_), _) => NotReady,
        _ => {
            return Err(TransitionError::Invalid {
                event,
                field: event.field(),
                from,
            })
        }
    };
    Ok(to)
}

impl From<&ChapterRef> for ChapterState {
    fn from(chapter: &ChapterRef) -> Self {
        Self::new(chapter.download_status, chapter.translation_status)
    }
}

impl ChapterRef {
    /// Run `event` through the state machine and store the result.
    pub fn apply(&mut self, event: ChapterEvent) -> Result<(), TransitionError> {
        let mut state = ChapterState::from(&*self);
        state.apply(event)?;
        self.download_status = state.download;
        self.translation_status = state.translation;
        Ok(())
    }

    pub fn state(&self) -> ChapterState {
        ChapterState::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_status() -> impl Strategy<Value = Status> {
        prop_oneof![
            Just(Status::NotReady),
            Just(Status::Loading),
            Just(Status::Ready),
            Just(Status::Removing),
        ]
    }

    fn arb_field() -> impl Strategy<Value = StatusField> {
        prop_oneof![Just(StatusField::Download), Just(StatusField::Translation)]
    }

    fn arb_event() -> impl Strategy<Value = ChapterEvent> {
        prop_oneof![
            Just(ChapterEvent::DownloadStarted),
            Just(ChapterEvent::DownloadSucceeded),
            Just(ChapterEvent::DownloadFailed),
            Just(ChapterEvent::TranslationAccepted),
            Just(ChapterEvent::TranslationCompleted),
            Just(ChapterEvent::TranslationSkipped),
            Just(ChapterEvent::TranslationFailed),
            arb_field().prop_map(ChapterEvent::RemoveRequested),
            arb_field().prop_map(ChapterEvent::RemoveFinished),
            arb_field().prop_map(ChapterEvent::Reset),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Translation only ever enters LOADING while download is READY.
        #[test]
        fn prop_translation_requires_download_ready(
            events in proptest::collection::vec(arb_event(), 0..40)
        ) {
            let mut state = ChapterState::default();
            for event in events {
                let before = state;
                let result = state.apply(event);
                if result.is_ok()
                    && event == ChapterEvent::TranslationAccepted
                {
                    prop_assert_eq!(before.download, Status::Ready);
                    prop_assert_eq!(state.translation, Status::Loading);
                }
            }
        }

        /// Rejected events leave both axes unchanged; accepted ones touch only their axis.
        #[test]
        fn prop_apply_touches_one_axis(
            download in arb_status(),
            translation in arb_status(),
            event in arb_event(),
        ) {
            let mut state = ChapterState::new(download, translation);
            let before = state;
            match state.apply(event) {
                Err(_) => prop_assert_eq!(state, before),
                Ok(()) => match event.field() {
                    StatusField::Download => prop_assert_eq!(state.translation, before.translation),
                    StatusField::Translation => prop_assert_eq!(state.download, before.download),
                },
            }
        }

        /// NOT_READY is reachable from any state: translation first, then download.
        #[test]
        fn prop_reset_always_reaches_not_ready(
            download in arb_status(),
            translation in arb_status(),
        ) {
            let mut state = ChapterState::new(download, translation);
            prop_assert!(state.apply(ChapterEvent::Reset(StatusField::Translation)).is_ok());
            prop_assert!(state.apply(ChapterEvent::Reset(StatusField::Download)).is_ok());
            prop_assert_eq!(state, ChapterState::default());
        }

        /// While translation is LOADING the pages stay READY.
        #[test]
        fn prop_download_pinned_while_translating(
            events in proptest::collection::vec(arb_event(), 0..60)
        ) {
            let mut state = ChapterState::default();
            for event in events {
                let _ = state.apply(event);
                if state.translation == Status::Loading {
                    prop_assert_eq!(state.download, Status::Ready);
                }
            }
        }

        /// Download-axis events are rejected while translation is LOADING.
        #[test]
        fn prop_download_events_rejected_while_translating(event in arb_event()) {
            prop_assume!(event.field() == StatusField::Download);
            let mut state = ChapterState::new(Status::Ready, Status::Loading);
            prop_assert_eq!(
                state.apply(event),
                Err(TransitionError::TranslationInFlight { event })
            );
            prop_assert_eq!(state, ChapterState::new(Status::Ready, Status::Loading));
        }
    }

    #[test]
    fn test_healthy_path_reaches_ready_ready() {
        let mut state = ChapterState::default();
        for event in [
            ChapterEvent::DownloadStarted,
            ChapterEvent::DownloadSucceeded,
            ChapterEvent::TranslationAccepted,
            ChapterEvent::TranslationCompleted,
        ] {
            state.apply(event).unwrap();
        }
        assert!(state.is_complete());
    }

    #[test]
    fn test_translation_rejected_before_download() {
        let mut state = ChapterState::default();
        let err = state.apply(ChapterEvent::TranslationAccepted).unwrap_err();
        assert_eq!(
            err,
            TransitionError::DownloadNotReady {
                download: Status::NotReady
            }
        );
        assert_eq!(state, ChapterState::default());
    }

    #[test]
    fn test_failed_download_reverts() {
        let mut state = ChapterState::default();
        state.apply(ChapterEvent::DownloadStarted).unwrap();
        state.apply(ChapterEvent::DownloadFailed).unwrap();
        assert_eq!(state.download, Status::NotReady);
    }

    #[test]
    fn test_skip_keeps_translation_not_ready() {
        let mut state = ChapterState::new(Status::Ready, Status::NotReady);
        state.apply(ChapterEvent::TranslationSkipped).unwrap();
        assert_eq!(state.translation, Status::NotReady);

        state.apply(ChapterEvent::TranslationAccepted).unwrap();
        state.apply(ChapterEvent::TranslationSkipped).unwrap();
        assert_eq!(state.translation, Status::NotReady);
    }

    #[test]
    fn test_remove_goes_through_removing() {
        let mut state = ChapterState::new(Status::Ready, Status::Ready);
        state
            .apply(ChapterEvent::RemoveRequested(StatusField::Download))
            .unwrap();
        assert_eq!(state.download, Status::Removing);
        assert_eq!(state.translation, Status::Ready);

        // finishing is only valid from REMOVING
        assert!(state
            .apply(ChapterEvent::RemoveFinished(StatusField::Translation))
            .is_err());

        state
            .apply(ChapterEvent::RemoveFinished(StatusField::Download))
            .unwrap();
        assert_eq!(state.download, Status::NotReady);
    }

    #[test]
    fn test_remove_pages_rejected_during_translation() {
        let mut state = ChapterState::new(Status::Ready, Status::NotReady);
        state.apply(ChapterEvent::TranslationAccepted).unwrap();
        assert!(matches!(
            state.apply(ChapterEvent::RemoveRequested(StatusField::Download)),
            Err(TransitionError::TranslationInFlight { .. })
        ));
        assert!(state.apply(ChapterEvent::DownloadStarted).is_err());

        state.apply(ChapterEvent::TranslationCompleted).unwrap();
        state
            .apply(ChapterEvent::RemoveRequested(StatusField::Download))
            .unwrap();
        assert_eq!(state.download, Status::Removing);
    }

    #[test]
    fn test_double_start_is_rejected() {
        let mut chapter = ChapterRef::new(3);
        chapter.apply(ChapterEvent::DownloadStarted).unwrap();
        let err = chapter.apply(ChapterEvent::DownloadStarted).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Invalid {
                from: Status::Loading,
                ..
            }
        ));
        assert_eq!(chapter.download_status, Status::Loading);
    }
}
