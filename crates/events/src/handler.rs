/// Execute an aggregate command in place (decide, then evolve).
///
/// No persistence and no publication: this is the unit-test and inline form
/// of the pipeline. Production paths go through `CommandDispatcher::dispatch`
/// in `medcart-infra`, which adds the event store and optimistic concurrency.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: medcart_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
