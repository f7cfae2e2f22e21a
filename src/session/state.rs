//! The Session stage machine: INIT → CONNECT → STREAM, with ERROR reachable
//! laterally from anywhere and DESTROY terminal from anywhere.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    Connect,
    Stream,
    Error,
    Destroy,
}

#[derive(Debug, thiserror::Error)]
#[error("illegal stage transition from {from:?} to {to:?}")]
pub struct StageTransitionError {
    pub from: Stage,
    pub to: Stage,
}

impl Stage {
    /// Validates and returns the next stage, rejecting any transition that
    /// would regress the state machine (see invariant 6: stage never moves
    /// backward except to DESTROY).
    pub fn transition(self, next: Stage) -> Result<Stage, StageTransitionError> {
        use Stage::*;
        let allowed = matches!(
            (self, next),
            (Init, Connect) | (Connect, Stream) | (_, Error) | (_, Destroy)
        );
        if allowed {
            Ok(next)
        } else {
            Err(StageTransitionError { from: self, to: next })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_happy_path() {
        let s = Stage::Init;
        let s = s.transition(Stage::Connect).unwrap();
        let s = s.transition(Stage::Stream).unwrap();
        let s = s.transition(Stage::Destroy).unwrap();
        assert_eq!(s, Stage::Destroy);
    }

    #[test]
    fn error_is_reachable_from_any_stage() {
        for stage in [Stage::Init, Stage::Connect, Stage::Stream] {
            assert_eq!(stage.transition(Stage::Error).unwrap(), Stage::Error);
        }
    }

    #[test]
    fn destroy_is_reachable_from_any_stage() {
        for stage in [Stage::Init, Stage::Connect, Stage::Stream, Stage::Error] {
            assert_eq!(stage.transition(Stage::Destroy).unwrap(), Stage::Destroy);
        }
    }

    #[test]
    fn rejects_skipping_connect() {
        assert!(Stage::Init.transition(Stage::Stream).is_err());
    }

    #[test]
    fn rejects_regression() {
        assert!(Stage::Stream.transition(Stage::Connect).is_err());
        assert!(Stage::Connect.transition(Stage::Init).is_err());
    }

    #[test]
    fn destroy_is_terminal() {
        assert!(Stage::Destroy.transition(Stage::Stream).is_err());
        assert!(Stage::Destroy.transition(Stage::Init).is_err());
    }
}
