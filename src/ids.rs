//! Newtype string identifiers, following the same pattern the teacher uses for
//! AE titles: thin wrappers so that a human-readable id, a DICOM AE title, and
//! an inference-server UID can never be accidentally swapped at a call site.

use aliri_braid::braid;

/// The AE title of a peer DICOM entity (either the peer pushing to us, or a
/// downstream destination we forward to).
#[braid(serde)]
pub struct AeTitle;

/// A fingerprint's human-readable model id, sent to the inference server as
/// the `human_readable_id` query parameter.
#[braid(serde)]
pub struct HumanReadableId;

/// The uid an inference server assigns to a posted task.
#[braid(serde)]
pub struct InferenceServerUid;
