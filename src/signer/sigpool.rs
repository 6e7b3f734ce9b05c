// LN Channel Core Library implementing Lightning-style payment channels
// Written in 2022-2024 by
//     LN Channel Core contributors
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Bounded worker pool for per-HTLC signature generation and verification.
//!
//! Jobs are strictly independent, so a batch fans out across the workers and
//! fans back in over a result channel. Every batch carries a cancel channel:
//! dropping its sending side after the first failure makes the remaining
//! jobs of the batch complete immediately without doing any work.

use std::sync::Arc;
use std::thread;

use amplify::Wrapper;
use bitcoin::Transaction;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SECP256K1};

use super::{Error, SignDescriptor, Signer};
use crate::scripts;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Verification job: a pre-computed sighash message, the signature under
/// test and the public key it must verify under.
#[derive(Clone, Debug)]
pub struct VerifyJob {
    pub message: secp256k1::Message,
    pub signature: Signature,
    pub pubkey: PublicKey,
}

/// Signing job: a second-level transaction and the descriptor for its only
/// input.
#[derive(Clone)]
pub struct SignJob {
    pub tx: Transaction,
    pub descriptor: SignDescriptor,
}

/// Fixed-size pool of signature workers shared by all channels of a node.
pub struct SigPool {
    injector: Option<Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl SigPool {
    /// Spawns a pool with one worker per available CPU (at least two).
    pub fn new() -> Arc<SigPool> {
        let workers = thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(2)
            .max(2);
        SigPool::with(workers)
    }

    /// Spawns a pool with an explicit worker count.
    pub fn with(workers: usize) -> Arc<SigPool> {
        let (injector, dispatch) = bounded::<Task>(workers * 4);
        let workers = (0..workers)
            .map(|index| {
                let dispatch: Receiver<Task> = dispatch.clone();
                thread::Builder::new()
                    .name(format!("sigpool-{}", index))
                    .spawn(move || {
                        while let Ok(task) = dispatch.recv() {
                            task();
                        }
                    })
                    .expect("spawning signature worker thread")
            })
            .collect();
        Arc::new(SigPool {
            injector: Some(injector),
            workers,
        })
    }

    fn submit(&self, task: Task) {
        self.injector
            .as_ref()
            .expect("pool alive while not dropped")
            .send(task)
            .expect("workers alive while pool not dropped");
    }

    /// Verifies a batch of signatures in parallel.
    ///
    /// Returns the error of the lowest-indexed failing job; remaining jobs
    /// of the batch are cancelled as soon as the first failure surfaces.
    pub fn verify_batch(&self, jobs: Vec<VerifyJob>) -> Result<(), Error> {
        let total = jobs.len();
        if total == 0 {
            return Ok(());
        }
        let (result_tx, result_rx) = bounded(total);
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let mut cancel_guard = Some(cancel_tx);

        for (index, job) in jobs.into_iter().enumerate() {
            let result_tx = result_tx.clone();
            let cancel_rx = cancel_rx.clone();
            self.submit(Box::new(move || {
                if cancelled(&cancel_rx) {
                    let _ = result_tx.send((index, Err(Error::Cancelled)));
                    return;
                }
                let outcome = SECP256K1
                    .verify_ecdsa(&job.message, &job.signature, &job.pubkey)
                    .map_err(|_| Error::InvalidSignature { index });
                let _ = result_tx.send((index, outcome));
            }));
        }
        drop(result_tx);

        let mut failure: Option<(usize, Error)> = None;
        for _ in 0..total {
            let (index, outcome) =
                result_rx.recv().expect("all jobs send exactly one result");
            if let Err(err) = outcome {
                if err == Error::Cancelled {
                    continue;
                }
                match failure {
                    Some((failed_index, _)) if failed_index <= index => {}
                    _ => failure = Some((index, err)),
                }
                // Dropping the sender closes the cancel channel
                cancel_guard.take();
            }
        }
        match failure {
            None => Ok(()),
            Some((_, err)) => Err(err),
        }
    }

    /// Produces signatures for a batch of independent signing jobs,
    /// preserving the order of the input.
    pub fn sign_batch(
        &self,
        signer: &Arc<dyn Signer>,
        jobs: Vec<SignJob>,
    ) -> Result<Vec<Signature>, Error> {
        let total = jobs.len();
        if total == 0 {
            return Ok(vec![]);
        }
        let (result_tx, result_rx) = bounded(total);
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let mut cancel_guard = Some(cancel_tx);

        for (index, job) in jobs.into_iter().enumerate() {
            let result_tx = result_tx.clone();
            let cancel_rx = cancel_rx.clone();
            let signer = Arc::clone(signer);
            self.submit(Box::new(move || {
                if cancelled(&cancel_rx) {
                    let _ = result_tx.send((index, Err(Error::Cancelled)));
                    return;
                }
                let outcome =
                    signer.sign_output_raw(&job.tx, &job.descriptor);
                let _ = result_tx.send((index, outcome));
            }));
        }
        drop(result_tx);

        let mut signatures: Vec<Option<Signature>> = vec![None; total];
        let mut failure = None;
        for _ in 0..total {
            let (index, outcome) =
                result_rx.recv().expect("all jobs send exactly one result");
            match outcome {
                Ok(sig) => signatures[index] = Some(sig),
                Err(Error::Cancelled) => {}
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                    cancel_guard.take();
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(signatures
            .into_iter()
            .map(|sig| sig.expect("every job succeeded"))
            .collect())
    }
}

impl Drop for SigPool {
    fn drop(&mut self) {
        // Closing the injector makes workers drain and exit
        self.injector.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Disconnected))
}

/// Convenience wrapper verifying a signature over a second-level
/// transaction outside of any batch.
pub fn verify_single(
    tx: &Transaction,
    descriptor: &SignDescriptor,
    signature: &Signature,
) -> Result<(), Error> {
    let message = scripts::segwit_sighash(
        tx,
        descriptor.input_index,
        descriptor.witness_script.as_inner(),
        descriptor.value,
    );
    SECP256K1
        .verify_ecdsa(&message, signature, &descriptor.pubkey)
        .map_err(|_| Error::InvalidSignature { index: 0 })
}

#[cfg(test)]
mod test {
    use secp256k1::SecretKey;

    use super::*;

    fn job(valid: bool, index: u8) -> VerifyJob {
        let seckey = SecretKey::from_slice(&[index + 1; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(SECP256K1, &seckey);
        let message =
            secp256k1::Message::from_slice(&[index + 0x40; 32]).unwrap();
        let signature = if valid {
            SECP256K1.sign_ecdsa(&message, &seckey)
        } else {
            let other =
                secp256k1::Message::from_slice(&[0xEE; 32]).unwrap();
            SECP256K1.sign_ecdsa(&other, &seckey)
        };
        VerifyJob {
            message,
            signature,
            pubkey,
        }
    }

    #[test]
    fn batch_of_valid_signatures_passes() {
        let pool = SigPool::with(4);
        let jobs = (0..32).map(|i| job(true, i)).collect();
        assert_eq!(pool.verify_batch(jobs), Ok(()));
    }

    #[test]
    fn first_invalid_signature_fails_batch() {
        let pool = SigPool::with(4);
        let mut jobs: Vec<_> = (0..16).map(|i| job(true, i)).collect();
        jobs[5] = job(false, 5);
        assert_eq!(
            pool.verify_batch(jobs),
            Err(Error::InvalidSignature { index: 5 })
        );
    }

    #[test]
    fn empty_batch_is_ok() {
        let pool = SigPool::with(2);
        assert_eq!(pool.verify_batch(vec![]), Ok(()));
        let signer: Arc<dyn Signer> =
            Arc::new(crate::signer::MemorySigner::default());
        assert_eq!(pool.sign_batch(&signer, vec![]).unwrap(), vec![]);
    }
}
