// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named futures returned by the [`BackupMachine`].

use std::{future::IntoFuture, pin::Pin, time::Duration};

use futures_core::{Future, Stream};
use futures_util::StreamExt;
use thiserror::Error;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::trace;

use super::{BackupMachine, UploadState};
use crate::utilities::ChannelObservable;

/// The error cases of waiting for the backup to reach its steady state.
#[derive(Clone, Copy, Debug, Error)]
pub enum SteadyStateError {
    /// The backup got disabled while we were waiting for the room keys to be
    /// uploaded.
    #[error("The backup got disabled while waiting for the room keys to be uploaded.")]
    BackupDisabled,

    /// Uploading the room keys failed; the upload will be retried once a new
    /// room key arrives.
    #[error("There was a connection error.")]
    Connection,

    /// We couldn't read status updates from the upload task quickly enough.
    #[error("We couldn't read status updates from the upload task quickly enough.")]
    Lagged,
}

/// A future that resolves once every room key the store knows about has been
/// uploaded to the active backup.
///
/// This is the "back everything up" entry point: awaiting it kicks the
/// upload loop and waits until nothing is pending. Subscribe to
/// [`WaitForSteadyState::subscribe_to_progress`] before awaiting to observe
/// the per-chunk progress.
#[derive(Debug)]
pub struct WaitForSteadyState<'a> {
    pub(super) machine: &'a BackupMachine,
    pub(super) progress: ChannelObservable<UploadState>,
    pub(super) timeout: Option<Duration>,
}

impl WaitForSteadyState<'_> {
    /// Subscribe to the progress of the key upload.
    pub fn subscribe_to_progress(
        &self,
    ) -> impl Stream<Item = Result<UploadState, BroadcastStreamRecvError>> {
        self.progress.subscribe()
    }

    /// Override the delay between two consecutive upload chunks for the
    /// duration of this request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.timeout = Some(delay);

        self
    }
}

impl<'a> IntoFuture for WaitForSteadyState<'a> {
    type Output = Result<(), SteadyStateError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let Self { machine, timeout, progress } = self;

            trace!("Waiting for the backup to reach its steady state");

            let old_delay = timeout.map(|delay| machine.set_upload_delay(delay));

            let ret = if machine.is_enabled() {
                // Reset any terminal state a previous run might have left
                // behind, then subscribe before triggering the upload so no
                // update can slip past us.
                progress.set(UploadState::Idle);
                let mut stream = progress.subscribe();

                machine.maybe_backup_keys().await;

                let mut ret = Ok(());

                while let Some(state) = stream.next().await {
                    trace!(?state, "Update while waiting for the backup steady state");

                    match state {
                        Ok(UploadState::Done) => {
                            ret = Ok(());
                            break;
                        }
                        Ok(UploadState::Error) => {
                            ret = if machine.is_enabled() {
                                Err(SteadyStateError::Connection)
                            } else {
                                Err(SteadyStateError::BackupDisabled)
                            };

                            break;
                        }
                        Err(_) => {
                            ret = Err(SteadyStateError::Lagged);
                            break;
                        }
                        _ => (),
                    }
                }

                ret
            } else {
                Err(SteadyStateError::BackupDisabled)
            };

            if let Some(old_delay) = old_delay {
                machine.set_upload_delay(old_delay);
            }

            ret
        })
    }
}
