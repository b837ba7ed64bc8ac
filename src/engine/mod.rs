mod call;
mod dispatch;
mod instance;
mod invocation;
mod param;

use std::any::type_name;
use std::marker::PhantomData;

use crate::core::TaskType;

pub use crate::engine::call::{Call, CallOptions, Method, Scope, method};
pub use crate::engine::dispatch::Dispatcher;
pub use crate::engine::instance::{Binding, CallInstance, HiddenId, NodeInfo, ParamRef};
pub use crate::engine::invocation::{Arg, Invocation};
pub use crate::engine::param::{Param, Slot};

/// Scalar parameter: one producer of type `T` per invocation.
///
/// When several producers of `T` exist, the call is invoked once for each of
/// them (combined with every value of the other scalar parameters).
pub struct One<T>(pub(crate) PhantomData<fn() -> T>);

/// List parameter: every producer of type `T` that fired, as one argument.
///
/// The call waits until all producers of `T` known to the graph have
/// completed.
pub struct Many<T>(pub(crate) PhantomData<fn() -> T>);

/// A single formal parameter that can appear in a [`Params`] tuple.
pub trait Input {
    /// The resolved argument handed to the user method.
    type Output<'a>;

    fn param(position: usize) -> Param;

    /// Resolves a type-erased argument into its concrete form.
    ///
    /// # Panics
    /// If the argument does not have the shape or type this parameter
    /// declared, which means the binding engine was bypassed.
    fn resolve(arg: &Arg) -> Self::Output<'_>;
}

impl<T> Input for One<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = &'a T;

    fn param(position: usize) -> Param {
        Param::new(TaskType::of::<T>(), position, false)
    }

    fn resolve(arg: &Arg) -> Self::Output<'_> {
        match arg {
            Arg::One(item) => item.downcast_ref::<T>().unwrap_or_else(|| {
                panic!("Expected {} but got something else", type_name::<T>())
            }),
            Arg::Many(_) => panic!("Expected {} but got a list", type_name::<T>()),
        }
    }
}

impl<T> Input for Many<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = Vec<&'a T>;

    fn param(position: usize) -> Param {
        Param::new(TaskType::of::<T>(), position, true)
    }

    fn resolve(arg: &Arg) -> Self::Output<'_> {
        match arg {
            Arg::Many(items) => items
                .iter()
                .map(|item| {
                    item.downcast_ref::<T>().unwrap_or_else(|| {
                        panic!("Expected {} but got something else", type_name::<T>())
                    })
                })
                .collect(),
            Arg::One(_) => panic!("Expected a list of {} but got one", type_name::<T>()),
        }
    }
}

/// A trait that enables a collection of [`One<T>`] and [`Many<T>`] markers to
/// be used as the parameter list of a call.
///
/// This trait is implemented for single markers and for tuples of them,
/// allowing them to be passed as the type argument of
/// [`Work::call`](crate::Work::call). It provides the formal parameter
/// definitions for the binding engine and resolves the frozen arguments of an
/// invocation into concrete references for the user method.
pub trait Params {
    /// The resulting type when all arguments are resolved.
    /// For a tuple `(One<A>, Many<B>)`, this will be `(&'a A, Vec<&'a B>)`.
    type Output<'a>;

    /// Returns the formal parameter for each position.
    fn params() -> Vec<Param>;

    /// Takes the type-erased arguments of an invocation and resolves them into
    /// the concrete `Output` type.
    ///
    /// # Panics
    /// This method will panic if the arguments cannot be downcast to their
    /// expected concrete types, indicating a severe logic error in the engine.
    fn resolve(args: &[Arg]) -> Self::Output<'_>;
}

impl Params for () {
    type Output<'a> = ();

    fn params() -> Vec<Param> {
        vec![]
    }

    fn resolve(_: &[Arg]) -> Self::Output<'_> {}
}

impl<I> Params for I
where
    I: Input,
{
    type Output<'a> = <I as Input>::Output<'a>;

    fn params() -> Vec<Param> {
        vec![<I as Input>::param(0)]
    }

    fn resolve(args: &[Arg]) -> Self::Output<'_> {
        <I as Input>::resolve(&args[0])
    }
}

macro_rules! impl_params {
    ($($P:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($P),*> Params for ($($P,)*)
        where
            $($P: Input),* {
            type Output<'a> = ($(<$P as Input>::Output<'a>,)*);

            #[allow(unused_assignments)]
            fn params() -> Vec<Param> {
                let mut position = 0;
                vec![$({
                    let param = <$P as Input>::param(position);
                    position += 1;
                    param
                }),*]
            }

            fn resolve(args: &[Arg]) -> Self::Output<'_> {
                let mut iter = args.iter();

                ($({
                    let arg = iter.next().unwrap_or_else(|| {
                        panic!("Missing argument for {}", type_name::<$P>())
                    });
                    <$P as Input>::resolve(arg)
                },)*)
            }
        }
    };
}

impl_params!(A);
impl_params!(A, B);
impl_params!(A, B, C);
impl_params!(A, B, C, D);
impl_params!(A, B, C, D, E);
impl_params!(A, B, C, D, E, F);
impl_params!(A, B, C, D, E, F, G);
impl_params!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Dynamic;
    use std::sync::Arc;

    struct X(u8);
    struct Y(u8);

    #[test]
    fn test_tuple_params() {
        let params = <(One<X>, Many<Y>)>::params();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], Param::new(TaskType::of::<X>(), 0, false));
        assert_eq!(params[1], Param::new(TaskType::of::<Y>(), 1, true));
    }

    #[test]
    fn test_resolve_tuple() {
        let args = vec![
            Arg::One(Arc::new(X(1))),
            Arg::Many(vec![Arc::new(Y(2)) as Dynamic, Arc::new(Y(3)) as Dynamic]),
        ];
        let (x, ys) = <(One<X>, Many<Y>)>::resolve(&args);
        assert_eq!(x.0, 1);
        assert_eq!(ys.iter().map(|y| y.0).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_single_marker() {
        assert_eq!(<One<X> as Params>::params().len(), 1);
        let args = vec![Arg::One(Arc::new(X(9)))];
        assert_eq!(<One<X> as Params>::resolve(&args).0, 9);
        assert!(<()>::params().is_empty());
    }

    #[test]
    #[should_panic(expected = "Expected")]
    fn test_resolve_wrong_type() {
        let args = vec![Arg::One(Arc::new(Y(1)))];
        <One<X> as Params>::resolve(&args);
    }
}
