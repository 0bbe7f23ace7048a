/*
    A node for two replicated services over an unreliable message-passing
    network:

    - broadcast: values submitted to any node are pushed once to every other
      node; each node answers reads from the set of values it has seen.
    - counter: every node increments its own slot of a grow-only counter kept
      in an external key-value store; a periodic anti-entropy round pushes the
      whole vector to every peer, who merge it with a pointwise maximum.

    Nodes speak newline-delimited JSON over stdin and stdout.
*/

pub mod common;
pub mod network;
pub mod protocol;
pub mod store;
