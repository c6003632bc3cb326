//! The [`IssuedCertificate`](crate::crd::IssuedCertificate) workflow as a pure transition table

use snafu::Snafu;

use crate::crd::IssuedCertificateState;

/// What the agent observed about a certificate in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Nothing needs to be observed to leave this state.
    Entered,
    /// The private key or the `CertificateRequest` has disappeared.
    InputsMissing,
    RequestPending,
    RequestFailed,
    RequestSigned,
    TargetMissing,
    TargetPresent,
    BounceWaiting,
    BounceDone,
}

/// What the agent needs to do when taking a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Nothing,
    /// Generate a new private key and publish a CSR for it.
    GenerateRequest,
    /// Keep the private key and `CertificateRequest` from being garbage collected.
    KeepRequest,
    /// Write the signed certificate chain to the target Secret.
    WriteIssuedSecret,
    /// Report that the issuer rejected the request.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: IssuedCertificateState,
    pub effect: Effect,
    /// Whether `next` should be evaluated again within the same pass.
    pub reevaluate: bool,
}

impl Transition {
    const fn to(next: IssuedCertificateState, effect: Effect) -> Self {
        Self {
            next,
            effect,
            reevaluate: false,
        }
    }

    const fn restart() -> Self {
        Self {
            next: IssuedCertificateState::Pending,
            effect: Effect::Nothing,
            reevaluate: true,
        }
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("issued certificate is in an unknown state"))]
    UnknownState,

    #[snafu(display("event {event:?} is not possible in state {state}"))]
    Impossible {
        state: IssuedCertificateState,
        event: Event,
    },
}

pub fn transition(state: IssuedCertificateState, event: Event) -> Result<Transition, Error> {
    use Effect::*;
    use Event::*;
    use IssuedCertificateState as S;
    Ok(match (state, event) {
        (S::Unknown, _) => return UnknownStateSnafu.fail(),

        (S::Pending, Entered) => Transition::to(S::Requested, GenerateRequest),

        (S::Requested, InputsMissing) => Transition::restart(),
        (S::Requested, RequestPending) => Transition::to(S::Requested, KeepRequest),
        (S::Requested, RequestFailed) => Transition::to(S::Failed, Fail),
        (S::Requested, RequestSigned) => Transition::to(S::Issued, WriteIssuedSecret),

        (S::Issued, TargetMissing) => Transition::restart(),
        (S::Issued, BounceWaiting) => Transition::to(S::Issued, Nothing),
        (S::Issued, BounceDone) => Transition::to(S::Finished, Nothing),

        (S::Finished, TargetPresent) => Transition::to(S::Finished, Nothing),
        (S::Finished, TargetMissing) => Transition::restart(),

        (S::Failed, Entered) => Transition::restart(),

        (state, event) => return ImpossibleSnafu { state, event }.fail(),
    })
}
