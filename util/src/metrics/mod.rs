pub use self::histogram_guard::HistogramGuard;

mod histogram_guard;
