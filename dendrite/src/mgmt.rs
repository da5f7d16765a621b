//! Management tokens and wire framing.
//!
//! All control traffic is framed as fixed-width integer words. A request is
//! one token word; commands that carry arguments are followed by additional
//! words in a fixed schema (see the `GET_DATA`/`SET_DATA` relays in
//! `service` and `runtime`). Command and response values are disjoint so
//! that a `peek` suffices to tell the direction of a word.

/// The fixed-width wire word. Tokens, counts, identifiers and raw `f64` bit
/// patterns all travel as this type.
pub type Word = i64;

/// Step count requesting a continuous run.
pub const MAX_STEPS: Word = Word::MAX;

/// The bare run token fanned to workers of an asynchronous sync domain.
pub const RUN: Word = 0;

// Raw command words. Any non-negative word on a controller-service channel
// is a step count.
const STOP: Word = -1;
const PAUSE: Word = -2;
const GET_DATA: Word = -3;
const SET_DATA: Word = -4;

// Raw response words.
const DONE: Word = -10;
const TERMINATED: Word = -11;
const ERROR: Word = -12;
const PAUSED: Word = -13;
const REQ_PRE_LRN_MGMT: Word = -14;
const REQ_LEARNING: Word = -15;
const REQ_POST_LRN_MGMT: Word = -16;
const REQ_PAUSE: Word = -17;
const REQ_STOP: Word = -18;

// Raw phase words.
const SPK: Word = 1;
const PRE_MGMT: Word = 2;
const LRN: Word = 3;
const POST_MGMT: Word = 4;
const HOST: Word = 5;

/// Commands flowing downward: controller to service, service to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run for the given number of steps (`MAX_STEPS` for continuous). On a
    /// service-worker channel of an asynchronous domain this is the bare
    /// `RUN` token.
    Run(Word),
    Stop,
    Pause,
    GetData,
    SetData,
}

impl Command {
    pub fn encode(self) -> Word {
        match self {
            Self::Run(steps) => steps,
            Self::Stop => STOP,
            Self::Pause => PAUSE,
            Self::GetData => GET_DATA,
            Self::SetData => SET_DATA,
        }
    }

    pub fn decode(word: Word) -> Option<Self> {
        match word {
            steps if steps >= 0 => Some(Self::Run(steps)),
            STOP => Some(Self::Stop),
            PAUSE => Some(Self::Pause),
            GET_DATA => Some(Self::GetData),
            SET_DATA => Some(Self::SetData),
            _ => None,
        }
    }
}

/// Responses flowing upward: worker to service, service to controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Ack, or finished with the command.
    Done,
    Terminated,
    Error,
    Paused,
    /// Request of a pre-learning management phase.
    ReqPreLrnMgmt,
    /// Request of a learning phase.
    ReqLearning,
    /// Request of a post-learning management phase.
    ReqPostLrnMgmt,
    ReqPause,
    ReqStop,
}

impl Response {
    pub fn encode(self) -> Word {
        match self {
            Self::Done => DONE,
            Self::Terminated => TERMINATED,
            Self::Error => ERROR,
            Self::Paused => PAUSED,
            Self::ReqPreLrnMgmt => REQ_PRE_LRN_MGMT,
            Self::ReqLearning => REQ_LEARNING,
            Self::ReqPostLrnMgmt => REQ_POST_LRN_MGMT,
            Self::ReqPause => REQ_PAUSE,
            Self::ReqStop => REQ_STOP,
        }
    }

    pub fn decode(word: Word) -> Option<Self> {
        match word {
            DONE => Some(Self::Done),
            TERMINATED => Some(Self::Terminated),
            ERROR => Some(Self::Error),
            PAUSED => Some(Self::Paused),
            REQ_PRE_LRN_MGMT => Some(Self::ReqPreLrnMgmt),
            REQ_LEARNING => Some(Self::ReqLearning),
            REQ_POST_LRN_MGMT => Some(Self::ReqPostLrnMgmt),
            REQ_PAUSE => Some(Self::ReqPause),
            REQ_STOP => Some(Self::ReqStop),
            _ => None,
        }
    }
}

/// Labeled slices of one simulation time step. A time step is counted by
/// occurrences of `Spk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Spk,
    PreMgmt,
    Lrn,
    PostMgmt,
    /// Entered before the first step of a run and after the last. Workers
    /// are silent during this phase.
    Host,
}

impl Phase {
    pub fn encode(self) -> Word {
        match self {
            Self::Spk => SPK,
            Self::PreMgmt => PRE_MGMT,
            Self::Lrn => LRN,
            Self::PostMgmt => POST_MGMT,
            Self::Host => HOST,
        }
    }

    pub fn decode(word: Word) -> Option<Self> {
        match word {
            SPK => Some(Self::Spk),
            PRE_MGMT => Some(Self::PreMgmt),
            LRN => Some(Self::Lrn),
            POST_MGMT => Some(Self::PostMgmt),
            HOST => Some(Self::Host),
            _ => None,
        }
    }
}

/// Encodes a numeric payload item for the wire.
pub fn data_word(value: f64) -> Word {
    value.to_bits() as Word
}

/// Decodes a numeric payload item from the wire.
pub fn word_data(word: Word) -> f64 {
    f64::from_bits(word as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_and_response_words_are_disjoint() {
        let commands = vec![
            Command::Run(0),
            Command::Run(MAX_STEPS),
            Command::Stop,
            Command::Pause,
            Command::GetData,
            Command::SetData,
        ];
        let responses = vec![
            Response::Done,
            Response::Terminated,
            Response::Error,
            Response::Paused,
            Response::ReqPreLrnMgmt,
            Response::ReqLearning,
            Response::ReqPostLrnMgmt,
            Response::ReqPause,
            Response::ReqStop,
        ];
        for response in responses {
            let word = response.encode();
            // a peek must suffice to distinguish direction
            assert_eq!(Command::decode(word), None);
            assert_eq!(Response::decode(word), Some(response));
        }
        for command in commands {
            assert_eq!(Response::decode(command.encode()), None);
        }
    }

    #[test]
    fn step_counts_decode_as_run() {
        assert_eq!(Command::decode(3), Some(Command::Run(3)));
        assert_eq!(Command::decode(MAX_STEPS), Some(Command::Run(MAX_STEPS)));
        // unknown negative words decode as neither command nor phase
        assert_eq!(Command::decode(-99), None);
        assert_eq!(Phase::decode(-99), None);
    }

    #[test]
    fn payload_survives_the_wire() {
        for value in [0.0, -1.5, 1e300, f64::MIN_POSITIVE] {
            assert_eq!(word_data(data_word(value)), value);
        }
    }
}
