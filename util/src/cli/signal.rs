use tokio::signal::unix;

pub const TERMINATION_SIGNALS: [libc::c_int; 5] = [
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGQUIT,
    libc::SIGABRT,
    libc::SIGTSTP,
];

/// Resolves with the first of the specified signals received by the process.
pub fn any_signal<I, T>(signals: I) -> impl Future<Output = std::io::Result<unix::SignalKind>>
where
    I: IntoIterator<Item = T>,
    T: Into<unix::SignalKind>,
{
    let listeners = signals
        .into_iter()
        .map(|signal| {
            let signal = signal.into();
            unix::signal(signal).map(|rx| (signal, rx))
        })
        .collect::<std::io::Result<Vec<_>>>();

    async move {
        let mut listeners = listeners?;
        let futures = listeners.iter_mut().map(|(signal, rx)| {
            let signal = *signal;
            Box::pin(async move {
                rx.recv().await;
                signal
            })
        });

        let (signal, _, _) = futures_util::future::select_all(futures).await;
        Ok(signal)
    }
}
